//! # Vireo BitTorrent Client
//!
//! A command-line BitTorrent client written in Rust.
//!
//! ## Features
//!
//! - Bencode inspection of arbitrary values and torrent files
//! - HTTP tracker peer discovery
//! - Peer wire handshake and multi-peer concurrent downloading
//! - Magnet link bootstrap over the ut_metadata extension
//! - Piece verification with SHA-1 hashing
//!
//! ## Usage
//!
//! ```bash
//! vireo info sample.torrent
//! vireo download -o sample.txt sample.torrent
//! vireo magnet_info "magnet:?xt=urn:btih:..."
//! ```
//!
//! ## Architecture
//!
//! The client follows a multi-threaded architecture:
//!
//! - **Main thread**: Parses arguments, coordinates the download
//! - **Worker threads**: Each owns one peer connection
//! - **Channels**: Coordinate piece work distribution and result collection

#[macro_use]
extern crate log;

mod bencode;
mod client;
mod error;
mod extension;
mod handshake;
mod magnet;
mod message;
mod peer;
mod piece;
mod torrent;
mod tracker;
mod worker;

use std::fs::File;
use std::io::Write;
use std::net::SocketAddrV4;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};

use client::Client;
use magnet::MagnetLink;
use peer::Peer;
use torrent::Torrent;

#[derive(Parser, Debug)]
#[command(version, about = "A command-line BitTorrent client, written in Rust.")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode a bencoded value and print it as JSON
    Decode {
        /// The bencoded value
        value: String,
    },
    /// Print the metainfo summary of a torrent file
    Info {
        /// Path to the .torrent file
        torrent: PathBuf,
    },
    /// Print the peers the tracker knows for a torrent
    Peers {
        /// Path to the .torrent file
        torrent: PathBuf,
    },
    /// Handshake with one peer and print its peer id
    Handshake {
        /// Path to the .torrent file
        torrent: PathBuf,
        /// Peer address as ip:port
        peer: String,
    },
    /// Download a single piece
    #[command(name = "download_piece")]
    DownloadPiece {
        /// Output filename
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
        /// Path to the .torrent file
        torrent: PathBuf,
        /// Zero-based piece index
        piece: u32,
    },
    /// Download the whole file
    Download {
        /// Output filename (defaults to name from torrent)
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
        /// Path to the .torrent file
        torrent: PathBuf,
    },
    /// Print the tracker and infohash of a magnet link
    #[command(name = "magnet_parse")]
    MagnetParse {
        /// The magnet URI
        magnet: String,
    },
    /// Handshake with a peer from a magnet link's swarm
    #[command(name = "magnet_handshake")]
    MagnetHandshake {
        /// The magnet URI
        magnet: String,
    },
    /// Fetch metadata from the swarm and print the metainfo summary
    #[command(name = "magnet_info")]
    MagnetInfo {
        /// The magnet URI
        magnet: String,
    },
}

/// Sanitize a filename to prevent path traversal and basic issues.
fn sanitize_filename(filename: &str) -> String {
    // Replace path separators with underscores to prevent directory traversal
    let safe_name = filename.replace(['/', '\\'], "_");

    // Use default name if empty
    if safe_name.trim().is_empty() {
        "download".to_string()
    } else {
        safe_name
    }
}

/// Print the metainfo block shared by `info` and `magnet_info`.
fn print_torrent_info(torrent: &Torrent) {
    println!("Tracker URL: {}", torrent.announce());
    println!("Length: {}", torrent.length());
    println!("Info Hash: {}", torrent.info_hash_hex());
    println!("Piece Length: {}", torrent.piece_length());
    println!("Piece Hashes:");
    for hash in torrent.pieces_hashes() {
        println!("{}", hex::encode(hash));
    }
}

fn write_output(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = File::create(path)
        .with_context(|| format!("could not create output file {:?}", path))?;
    file.write_all(data)
        .with_context(|| format!("could not write to {:?}", path))?;
    Ok(())
}

fn run(args: Args) -> Result<()> {
    match args.command {
        Command::Decode { value } => {
            let decoded = bencode::decode(value.as_bytes())?;
            println!("{}", decoded.to_json());
        }

        Command::Info { torrent } => {
            let torrent = Torrent::open(&torrent)?;
            print_torrent_info(&torrent);
        }

        Command::Peers { torrent } => {
            let torrent = Torrent::open(&torrent)?;
            for peer in torrent.request_peers()? {
                println!("{}", peer);
            }
        }

        Command::Handshake { torrent, peer } => {
            let torrent = Torrent::open(&torrent)?;
            let addr: SocketAddrV4 = peer
                .parse()
                .map_err(|_| anyhow!("invalid peer address {:?}", peer))?;

            let mut client = Client::connect(Peer::from(addr))?;
            client.set_connection_timeout(10)?;
            let peer_handshake =
                client.handshake_with_peer(torrent.peer_id(), torrent.info_hash(), false)?;

            println!("Peer ID: {}", hex::encode(peer_handshake.peer_id));
        }

        Command::DownloadPiece {
            output,
            torrent,
            piece,
        } => {
            let torrent = Torrent::open(&torrent)?;
            let data = torrent.download_piece(piece)?;
            write_output(&output, &data)?;
            println!("Piece {} saved in {:?}.", piece, output);
        }

        Command::Download { output, torrent } => {
            let torrent = Torrent::open(&torrent)?;
            let output = output
                .unwrap_or_else(|| PathBuf::from(sanitize_filename(torrent.name())));

            let data = torrent.download()?;
            write_output(&output, &data)?;
            println!("Saved in {:?}.", output);
        }

        Command::MagnetParse { magnet } => {
            let link = MagnetLink::parse(&magnet)?;
            if let Some(announce) = link.announce() {
                println!("Tracker URL: {}", announce);
            }
            println!("Info Hash: {}", link.info_hash_hex());
        }

        Command::MagnetHandshake { magnet } => {
            let link = MagnetLink::parse(&magnet)?;
            let peer_id = tracker::generate_peer_id();
            let (_client, peer_handshake, extensions) = torrent::magnet_connect(&link, &peer_id)?;

            println!("Peer ID: {}", hex::encode(peer_handshake.peer_id));
            println!("Peer Metadata Extension ID: {}", extensions.metadata_id);
        }

        Command::MagnetInfo { magnet } => {
            let link = MagnetLink::parse(&magnet)?;
            let torrent = torrent::from_magnet(&link)?;
            print_torrent_info(&torrent);
        }
    }

    Ok(())
}

fn main() {
    // Initialize logger
    pretty_env_logger::init_timed();

    // Parse arguments
    let args = Args::parse();

    // Run program, eventually exit failure
    if let Err(error) = run(args) {
        eprintln!("Error: {}", error);
        std::process::exit(1);
    }

    // Exit success
    std::process::exit(0);
}
