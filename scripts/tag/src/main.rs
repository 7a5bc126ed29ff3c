use clap::Parser;
use colored::*;
use lofty::config::ParseOptions;
use lofty::prelude::*;
use lofty::probe::Probe;
use std::path::Path;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "cdg-tag", about = "Print the title and artist of an audio file's tag")]
struct Args {
    /// Audio file to inspect
    #[arg()]
    file: String,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() {
    let args = Args::parse();
    let path = Path::new(&args.file);

    let parse_opts = ParseOptions::new().read_properties(false);
    let tagged_file = match Probe::open(path) {
        Ok(probe) => match probe.options(parse_opts).read() {
            Ok(f) => f,
            Err(e) => {
                eprintln!("{} Cannot read tag from '{}': {}", "✗".red(), path.display(), e);
                std::process::exit(1);
            }
        },
        Err(e) => {
            eprintln!("{} Cannot open '{}': {}", "✗".red(), path.display(), e);
            std::process::exit(1);
        }
    };

    let mut title: Option<String> = None;
    let mut artist: Option<String> = None;
    for tag in tagged_file.tags() {
        if title.is_none() {
            title = tag.title().map(|s| s.to_string());
        }
        if artist.is_none() {
            artist = tag.artist().map(|s| s.to_string());
        }
    }

    if title.is_none() && artist.is_none() {
        eprintln!("{} '{}' has no tag frame", "✗".red(), path.display());
        std::process::exit(1);
    }

    let none = "(none)".bright_black().to_string();
    println!(
        "Title  : {}",
        title.map_or_else(|| none.clone(), |t| t.bright_white().to_string())
    );
    println!(
        "Artist : {}",
        artist.map_or_else(|| none.clone(), |a| a.bright_white().to_string())
    );
}
