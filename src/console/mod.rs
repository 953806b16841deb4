//! The command-line surface.
//!
//! Three commands: `download` runs the engine until the torrent seeds (or
//! forever with `--seed`), `verify` hash-checks existing data and prints
//! per-file completion, `show` prints parsed metainfo. Exit codes: 0
//! success, 1 generic error, 2 bad arguments (from the parser), 3 I/O
//! failure at startup.
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use riptide_configuration::Settings;
use riptide_metainfo::Metainfo;
use tracing::error;

use crate::app;
use crate::core::events::{Event, Observer};
use crate::core::storage::Storage;
use crate::core::torrent::TorrentStatus;
use crate::core::Engine;

pub const EXIT_OK: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_STARTUP_IO: i32 = 3;

#[derive(Debug, Parser)]
#[command(name = "riptide", version, about = "A BitTorrent peer engine")]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Download a torrent until it completes, then exit (or keep seeding).
    Download {
        /// Path to the .torrent file.
        torrent: PathBuf,
        /// Download directory; defaults to the current directory.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Directory for resume records.
        #[arg(long, env = "RIPTIDE_STATE_DIR")]
        state_dir: Option<PathBuf>,
        /// Global download ceiling, bytes per second.
        #[arg(long)]
        max_download_bps: Option<u64>,
        /// Global upload ceiling, bytes per second.
        #[arg(long)]
        max_upload_bps: Option<u64>,
        /// Keep seeding after completion until interrupted.
        #[arg(long)]
        seed: bool,
    },
    /// Hash-check existing data against a torrent and report per file.
    Verify {
        /// Path to the .torrent file.
        torrent: PathBuf,
        /// Directory the data was downloaded into.
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Print the parsed metainfo.
    Show {
        /// Path to the .torrent file.
        torrent: PathBuf,
    },
}

/// Run the parsed command to an exit code.
pub async fn run(cli: Cli) -> i32 {
    match cli.command {
        Command::Download {
            torrent,
            output,
            state_dir,
            max_download_bps,
            max_upload_bps,
            seed,
        } => download(&torrent, output, state_dir, max_download_bps, max_upload_bps, seed).await,
        Command::Verify { torrent, output } => verify(&torrent, &output).await,
        Command::Show { torrent } => show(&torrent),
    }
}

struct ConsoleObserver;

impl Observer for ConsoleObserver {
    fn handle_event(&self, event: &Event) {
        match event {
            Event::PieceVerified { piece, .. } => {
                tracing::debug!(piece, "piece verified");
            }
            Event::Completed { .. } => println!("download complete"),
            Event::TorrentErrored { error, .. } => error!(message = %error.message, "torrent failed"),
            _ => {}
        }
    }
}

async fn download(
    torrent: &Path,
    output: Option<PathBuf>,
    state_dir: Option<PathBuf>,
    max_download_bps: Option<u64>,
    max_upload_bps: Option<u64>,
    seed: bool,
) -> i32 {
    let bytes = match std::fs::read(torrent) {
        Ok(bytes) => bytes,
        Err(source) => {
            error!(?torrent, %source, "cannot read torrent file");
            return EXIT_STARTUP_IO;
        }
    };

    let output = output.unwrap_or_else(|| PathBuf::from("."));
    let settings = Settings {
        default_download_path: output,
        state_path: state_dir.unwrap_or_else(|| PathBuf::from(".riptide-state")),
        global_max_download_bps: max_download_bps,
        global_max_upload_bps: max_upload_bps,
        ..Settings::default()
    };

    let engine = match Engine::start(settings, vec![Arc::new(ConsoleObserver)]).await {
        Ok(engine) => engine,
        Err(source) => {
            error!(%source, "engine failed to start");
            return EXIT_STARTUP_IO;
        }
    };

    let id = match engine.add(&bytes, torrent, None) {
        Ok(id) => id,
        Err(source) => {
            error!(%source, "cannot add torrent");
            engine.shutdown().await;
            return EXIT_ERROR;
        }
    };

    let mut poll = tokio::time::interval(Duration::from_secs(1));
    let code = loop {
        tokio::select! {
            () = app::shutdown_signal() => break EXIT_OK,
            _ = poll.tick() => {
                let Ok(snapshot) = engine.get_snapshot(id).await else {
                    break EXIT_ERROR;
                };
                match snapshot.status {
                    TorrentStatus::Error => break EXIT_ERROR,
                    TorrentStatus::Seeding if !seed => break EXIT_OK,
                    _ => {
                        eprintln!(
                            "{:>6.1}%  down {}/s  up {}/s  peers {}/{}",
                            snapshot.progress * 100.0,
                            human_bytes(snapshot.down_bps),
                            human_bytes(snapshot.up_bps),
                            snapshot.peers_active,
                            snapshot.peers_connected,
                        );
                    }
                }
            }
        }
    };

    engine.shutdown().await;
    code
}

async fn verify(torrent: &Path, output: &Path) -> i32 {
    let bytes = match std::fs::read(torrent) {
        Ok(bytes) => bytes,
        Err(source) => {
            error!(?torrent, %source, "cannot read torrent file");
            return EXIT_STARTUP_IO;
        }
    };
    let metainfo = match Metainfo::parse(&bytes) {
        Ok(metainfo) => Arc::new(metainfo),
        Err(source) => {
            error!(%source, "invalid torrent file");
            return EXIT_ERROR;
        }
    };

    let storage = match Storage::new(Arc::clone(&metainfo), output) {
        Ok(storage) => storage,
        Err(source) => {
            error!(%source, "storage setup failed");
            return EXIT_ERROR;
        }
    };

    let piece_count = metainfo.piece_count();
    let bitfield = match storage
        .verify_existing(move |done, total| {
            if done % 64 == 0 || done == total {
                eprintln!("verified {done}/{total} pieces");
            }
        })
        .await
    {
        Ok(bitfield) => bitfield,
        Err(source) => {
            error!(%source, "verification failed");
            return EXIT_ERROR;
        }
    };

    // Per-file verified byte counts.
    let mut file_verified = vec![0u64; metainfo.files().len()];
    for piece in bitfield.set_indexes() {
        for slice in metainfo.files_for_piece(piece) {
            file_verified[slice.file_index] += u64::from(slice.length);
        }
    }

    println!(
        "{}: {}/{} pieces verified",
        metainfo.name(),
        bitfield.set_count(),
        piece_count
    );
    for (index, file) in metainfo.files().iter().enumerate() {
        let percent = if file.length == 0 {
            100.0
        } else {
            file_verified[index] as f64 / file.length as f64 * 100.0
        };
        println!("  {:>6.1}%  {}", percent, file.path.display());
    }

    EXIT_OK
}

fn show(torrent: &Path) -> i32 {
    let bytes = match std::fs::read(torrent) {
        Ok(bytes) => bytes,
        Err(source) => {
            error!(?torrent, %source, "cannot read torrent file");
            return EXIT_STARTUP_IO;
        }
    };
    let metainfo = match Metainfo::parse(&bytes) {
        Ok(metainfo) => metainfo,
        Err(source) => {
            error!(%source, "invalid torrent file");
            return EXIT_ERROR;
        }
    };

    println!("name:         {}", metainfo.name());
    println!("info-hash:    {}", metainfo.info_hash());
    println!("total size:   {}", human_bytes(metainfo.total_length()));
    println!(
        "pieces:       {} x {}",
        metainfo.piece_count(),
        human_bytes(u64::from(metainfo.nominal_piece_length()))
    );
    if let Some(comment) = metainfo.comment() {
        println!("comment:      {comment}");
    }
    if let Some(created_by) = metainfo.created_by() {
        println!("created by:   {created_by}");
    }
    if let Some(creation_date) = metainfo.creation_date() {
        println!("created at:   {creation_date}");
    }
    for (tier_index, tier) in metainfo.trackers().iter().enumerate() {
        for url in tier {
            println!("tracker[{tier_index}]:   {url}");
        }
    }
    println!("files:");
    for file in metainfo.files() {
        println!("  {:>12}  {}", human_bytes(file.length), file.path.display());
    }

    EXIT_OK
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} {}", UNITS[0])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{human_bytes, Cli};

    #[test]
    fn the_cli_parses_its_commands() {
        assert!(Cli::try_parse_from(["riptide", "show", "a.torrent"]).is_ok());
        assert!(Cli::try_parse_from(["riptide", "verify", "a.torrent", "-o", "dir"]).is_ok());
        assert!(Cli::try_parse_from([
            "riptide",
            "download",
            "a.torrent",
            "-o",
            "dir",
            "--max-download-bps",
            "1000000",
            "--seed",
        ])
        .is_ok());
        assert!(Cli::try_parse_from(["riptide", "nonsense"]).is_err());
    }

    #[test]
    fn byte_counts_humanize() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(16 * 1024), "16.0 KiB");
        assert_eq!(human_bytes(3 * 1024 * 1024 / 2), "1.5 MiB");
    }
}
