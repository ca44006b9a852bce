//! Command line front-end for the cratetorrent engine (spec §6): reads a
//! `.torrent` file, starts the engine, and prints progress once a second
//! until the download completes or fails fatally.

use std::{fs, path::PathBuf, process};

use cratetorrent::{
    metainfo::Metainfo, Alert, Conf, Engine, PieceCounter, TorrentId,
    TorrentParams,
};
use structopt::StructOpt;

#[derive(StructOpt)]
#[structopt(name = "cratetorrent", about = "A simple BitTorrent client")]
struct Args {
    /// Path to the `.torrent` file to download.
    torrent: PathBuf,

    /// Directory to download the torrent's files into.
    #[structopt(short, long, default_value = ".")]
    download_dir: PathBuf,

    /// Raise the log level to debug for the cratetorrent crate.
    #[structopt(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::from_args();
    init_logger(args.verbose);

    if let Err(e) = run(args).await {
        eprintln!("error: {}", e);
        process::exit(1);
    }
}

fn init_logger(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(
        env_logger::Env::default()
            .default_filter_or(format!("cratetorrent={}", level)),
    )
    .init();
}

async fn run(args: Args) -> cratetorrent::Result<()> {
    let torrent_bytes = fs::read(&args.torrent).map_err(|e| {
        log::error!("Couldn't read {}: {}", args.torrent.display(), e);
        cratetorrent::Error::from(e)
    })?;
    let metainfo = Metainfo::from_bytes(&torrent_bytes)?;
    let piece_count = metainfo.piece_count();

    let conf = Conf::new(args.download_dir);
    let (engine, mut alerts) = Engine::new(conf)?;
    let id: TorrentId = engine.create_torrent(TorrentParams {
        metainfo,
        conf: None,
    })?;

    while let Some(alert) = alerts.recv().await {
        match alert {
            Alert::TorrentStats {
                id: alert_id,
                downloaded_piece_count,
                piece_count: total,
            } if alert_id == id => {
                let counter =
                    PieceCounter::from_counts(downloaded_piece_count, total);
                println!("{}  downloading", counter);
            }
            Alert::TorrentComplete { id: alert_id } if alert_id == id => {
                let counter = PieceCounter::from_counts(piece_count, piece_count);
                println!("{}  complete", counter);
                return Ok(());
            }
            Alert::Error {
                id: alert_id,
                error,
            } if alert_id == id => {
                return Err(error);
            }
            _ => {}
        }
    }

    Ok(())
}
