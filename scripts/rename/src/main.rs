use chrono::Local;
use clap::Parser;
use colored::*;
use lofty::config::ParseOptions;
use lofty::prelude::*;
use lofty::probe::Probe;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use walkdir::WalkDir;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "cdg-rename", about = "Rename karaoke MP3/CDG pairs from their ID3 tags")]
struct Args {
    /// Directory to scan (defaults to the current directory)
    #[arg(default_value = ".")]
    dir: String,

    /// Show what would be renamed without touching any file
    #[arg(long)]
    dry_run: bool,

    /// Where to write the undo script
    #[arg(long, default_value = "undo.sh")]
    undo_file: String,

    /// Skip writing the undo script
    #[arg(long)]
    no_undo: bool,
}

// ---------------------------------------------------------------------------
// Data structures
// ---------------------------------------------------------------------------

/// Files sharing one basename inside one directory, keyed by lowercased
/// extension.
type FileGroup = BTreeMap<String, PathBuf>;

/// Grouping key. Same-named files in different directories are separate
/// groups; every file in a group gets the same new name and suffix.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct GroupKey {
    dir: PathBuf,
    name: String,
}

/// Artist and title pulled from an audio file's tag.
#[derive(Debug)]
struct TagInfo {
    artist: String,
    title: String,
}

#[derive(Debug, Default)]
struct RunReport {
    renamed_files: u64,
    renamed_groups: u64,
    skipped_groups: u64,
    missing_cdg: BTreeMap<String, Vec<PathBuf>>,
    missing_mp3: BTreeMap<String, Vec<PathBuf>>,
}

/// Failures that abort the whole run, not just the current group.
#[derive(Debug)]
enum FatalError {
    /// The conflict check said this slot was free, yet a file is sitting in
    /// it. Stopping here is the only safe option.
    DestinationExists { from: PathBuf, to: PathBuf },
    Io(io::Error),
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalError::DestinationExists { from, to } => write!(
                f,
                "'{}' is already taken while renaming '{}'; aborting before anything is overwritten",
                to.display(),
                from.display()
            ),
            FatalError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl From<io::Error> for FatalError {
    fn from(e: io::Error) -> Self {
        FatalError::Io(e)
    }
}

// ---------------------------------------------------------------------------
// Undo log
// ---------------------------------------------------------------------------

/// Shell script that reverts the run, written incrementally so it is useful
/// even after an aborted run. `disabled()` turns every call into a no-op.
struct UndoLog {
    writer: Option<BufWriter<fs::File>>,
}

impl UndoLog {
    fn create(path: &Path) -> io::Result<UndoLog> {
        let mut writer = BufWriter::new(fs::File::create(path)?);
        writeln!(writer, "#!/bin/sh")?;
        writeln!(
            writer,
            "# You can use this file to revert the changes made by cdg-rename"
        )?;
        writeln!(writer, "# on {}.", Local::now().format("%Y-%m-%d %H:%M:%S"))?;
        Ok(UndoLog {
            writer: Some(writer),
        })
    }

    fn disabled() -> UndoLog {
        UndoLog { writer: None }
    }

    /// One reversal command per performed rename.
    fn record(&mut self, from: &Path, to: &Path) -> io::Result<()> {
        if let Some(w) = self.writer.as_mut() {
            writeln!(w, "mv -v {} {}", shell_quote(to), shell_quote(from))?;
        }
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        if let Some(mut w) = self.writer.take() {
            w.flush()?;
        }
        Ok(())
    }
}

/// Single-quote a path for the undo script; embedded quotes become '\''.
fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.to_string_lossy().replace('\'', r"'\''"))
}

// ---------------------------------------------------------------------------
// Title sanitizer
// ---------------------------------------------------------------------------

/// Turn a raw "artist - title" string into a name safe to use as a filename.
/// Idempotent; an empty result means the tag had nothing usable.
fn clean_title(raw: &str) -> String {
    // Collapse whitespace runs so the ": " swap sees normalized spacing.
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");

    // ': ' marks a subtitle; turn it into a dash before ':' is underscored.
    let collapsed = collapsed.replace(": ", " - ");

    let mut cleaned = String::with_capacity(collapsed.len());
    for c in collapsed.chars() {
        match c {
            '?' | '*' | '\\' | '|' => {}
            '<' | '^' | '>' | '"' | ':' => cleaned.push('_'),
            _ => cleaned.push(c),
        }
    }

    // Deletions can butt spaces together; squeeze space and underscore runs.
    let mut squeezed = String::with_capacity(cleaned.len());
    let mut prev = '\0';
    for c in cleaned.chars() {
        if (c == ' ' || c == '_') && c == prev {
            continue;
        }
        squeezed.push(c);
        prev = c;
    }

    squeezed
        .trim_start_matches(|c: char| {
            !(c.is_ascii_alphanumeric() || matches!(c, '\'' | '$' | '(' | '['))
        })
        .trim_end_matches(|c: char| {
            !(c.is_ascii_alphanumeric() || matches!(c, '\'' | '.' | '$' | '!' | ')' | ']'))
        })
        .to_string()
}

/// Multi-artist tags come slash-separated ("A/B"); join them with "; ".
fn normalize_artist(artist: &str) -> String {
    artist
        .split('/')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("; ")
}

// ---------------------------------------------------------------------------
// File scanner
// ---------------------------------------------------------------------------

/// Walk the tree and group every file that has an extension by its directory
/// and basename. The basename is everything before the final extension, so
/// "track.1.mp3" groups as "track.1".
fn scan_groups(root: &Path) -> BTreeMap<GroupKey, FileGroup> {
    let mut groups: BTreeMap<GroupKey, FileGroup> = BTreeMap::new();

    for entry in WalkDir::new(root)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.into_path();

        let ext = match path.extension() {
            Some(e) => e.to_string_lossy().to_lowercase(),
            None => continue,
        };
        let name = match path.file_stem() {
            Some(s) => s.to_string_lossy().to_string(),
            None => continue,
        };
        let dir = path.parent().unwrap_or(root).to_path_buf();

        groups
            .entry(GroupKey { dir, name })
            .or_default()
            .insert(ext, path);
    }

    groups
}

// ---------------------------------------------------------------------------
// Tag reader
// ---------------------------------------------------------------------------

/// Pull artist and title out of the file's tag containers. Both are required
/// for building a name, so anything unreadable comes back as None.
fn read_tag(path: &Path) -> Option<TagInfo> {
    let parse_opts = ParseOptions::new().read_properties(false);
    let tagged_file = Probe::open(path).ok()?.options(parse_opts).read().ok()?;

    let mut artist: Option<String> = None;
    let mut title: Option<String> = None;
    for tag in tagged_file.tags() {
        if artist.is_none() {
            artist = tag.artist().map(|s| s.to_string());
        }
        if title.is_none() {
            title = tag.title().map(|s| s.to_string());
        }
    }

    let artist = artist.filter(|s| !s.trim().is_empty())?;
    let title = title.filter(|s| !s.trim().is_empty())?;
    Some(TagInfo { artist, title })
}

// ---------------------------------------------------------------------------
// Conflict resolver
// ---------------------------------------------------------------------------

fn target_path(dir: &Path, name: &str, suffix: Option<u32>, ext: &str) -> PathBuf {
    match suffix {
        Some(n) => dir.join(format!("{}.{}.{}", name, n, ext)),
        None => dir.join(format!("{}.{}", name, ext)),
    }
}

/// Smallest suffix (None before 0, 1, ...) whose candidate paths are free for
/// every extension in the group. A candidate that is the source file itself
/// is not a conflict. The suffix is chosen group-wide so the MP3 and its
/// sidecar always end up with matching names.
fn resolve_suffix(dir: &Path, name: &str, group: &FileGroup) -> Option<u32> {
    let mut suffix: Option<u32> = None;
    loop {
        let conflict = group.iter().any(|(ext, src)| {
            let candidate = target_path(dir, name, suffix, ext);
            candidate != *src && candidate.exists()
        });
        if !conflict {
            return suffix;
        }
        suffix = Some(suffix.map_or(0, |n| n + 1));
    }
}

// ---------------------------------------------------------------------------
// Renamer
// ---------------------------------------------------------------------------

fn rename_group(
    key: &GroupKey,
    group: &FileGroup,
    name: &str,
    undo: &mut UndoLog,
    dry_run: bool,
) -> Result<u64, FatalError> {
    let suffix = resolve_suffix(&key.dir, name, group);
    let shown = match suffix {
        Some(n) => format!("{}.{}", name, n),
        None => name.to_string(),
    };
    print!("'{}'", shown.bright_white());
    io::stdout().flush().ok();

    rename_with_suffix(key, group, name, suffix, undo, dry_run)
}

/// Rename every file in the group, recording one undo entry per rename.
/// A destination that exists at this point means the conflict check above
/// was wrong or the directory changed underneath us; that is fatal.
fn rename_with_suffix(
    key: &GroupKey,
    group: &FileGroup,
    name: &str,
    suffix: Option<u32>,
    undo: &mut UndoLog,
    dry_run: bool,
) -> Result<u64, FatalError> {
    let mut renamed = 0u64;
    for (ext, old_path) in group {
        let new_path = target_path(&key.dir, name, suffix, ext);
        if new_path == *old_path {
            continue;
        }
        if new_path.exists() {
            return Err(FatalError::DestinationExists {
                from: old_path.clone(),
                to: new_path,
            });
        }
        if !dry_run {
            undo.record(old_path, &new_path)?;
            fs::rename(old_path, &new_path)?;
        }
        print!(" {}", ext.green());
        renamed += 1;
    }
    Ok(renamed)
}

// ---------------------------------------------------------------------------
// Per-group pipeline
// ---------------------------------------------------------------------------

fn record_missing(map: &mut BTreeMap<String, Vec<PathBuf>>, key: &GroupKey, group: &FileGroup) {
    map.entry(key.name.clone())
        .or_default()
        .extend(group.values().cloned());
}

fn process_group(
    key: &GroupKey,
    group: &FileGroup,
    undo: &mut UndoLog,
    dry_run: bool,
    report: &mut RunReport,
) -> Result<(), FatalError> {
    print!(
        "  {} {}x '{}.*' -> ",
        "→".bright_black(),
        group.len(),
        key.name
    );
    io::stdout().flush().ok();

    if !group.contains_key("cdg") {
        record_missing(&mut report.missing_cdg, key, group);
        report.skipped_groups += 1;
        println!("{}", "missing CDG, see report".yellow());
        return Ok(());
    }

    let mp3_path = match group.get("mp3") {
        Some(p) => p,
        None => {
            record_missing(&mut report.missing_mp3, key, group);
            report.skipped_groups += 1;
            println!("{}", "missing MP3, see report".yellow());
            return Ok(());
        }
    };

    let tag = match read_tag(mp3_path) {
        Some(t) => t,
        None => {
            report.skipped_groups += 1;
            println!("{}", "no readable tag, skipped".bright_black());
            return Ok(());
        }
    };

    let new_name = clean_title(&format!("{} - {}", normalize_artist(&tag.artist), tag.title));
    if new_name.is_empty() {
        report.skipped_groups += 1;
        println!("{}", "tag cleans to nothing, skipped".bright_black());
        return Ok(());
    }
    if new_name == key.name {
        report.skipped_groups += 1;
        println!("{}", "already named correctly".bright_black());
        return Ok(());
    }

    let renamed = rename_group(key, group, &new_name, undo, dry_run)?;
    report.renamed_files += renamed;
    if renamed > 0 {
        report.renamed_groups += 1;
    }
    if dry_run {
        println!(" {}", "○ (dry run)".cyan());
    } else {
        println!(" {}", "✓".green());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Reporter
// ---------------------------------------------------------------------------

fn print_report(report: &RunReport) {
    if report.missing_cdg.is_empty() && report.missing_mp3.is_empty() {
        println!("  {} Every group had both MP3 and CDG", "✓".green());
        return;
    }

    if !report.missing_cdg.is_empty() {
        println!(
            "  {} Files without a corresponding CDG:",
            "✗".yellow().bold()
        );
        for paths in report.missing_cdg.values() {
            for p in paths {
                println!("    \"{}\"", p.display());
            }
        }
    }
    if !report.missing_mp3.is_empty() {
        println!(
            "  {} Files with no MP3 by the same name:",
            "✗".yellow().bold()
        );
        for paths in report.missing_mp3.values() {
            for p in paths {
                println!("    \"{}\"", p.display());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() {
    let args = Args::parse();
    let root = PathBuf::from(&args.dir);

    println!("{}", "CDG Renamer".bright_cyan().bold());
    println!("{}", "===========".bright_black());
    println!("Scan dir : {}", root.display().to_string().bright_white());
    if args.dry_run {
        println!(
            "Mode     : {} (no changes will be made)",
            "DRY RUN".yellow().bold()
        );
    }
    if args.no_undo {
        println!("Undo     : {}", "disabled".yellow());
    } else if !args.dry_run {
        println!("Undo     : {}", args.undo_file.bright_white());
    }
    println!();

    let start = Instant::now();

    println!("{} Walking directory tree...", "[1/3]".bright_blue().bold());
    let groups = scan_groups(&root);
    let total_files: usize = groups.values().map(|g| g.len()).sum();
    println!(
        "  {} Found {} files representing {} unique titles",
        "✓".green(),
        total_files.to_string().bright_white(),
        groups.len().to_string().bright_white()
    );
    println!();

    if total_files == 0 {
        println!("Nothing to rename.");
        return;
    }

    let mut undo = if args.dry_run || args.no_undo {
        UndoLog::disabled()
    } else {
        match UndoLog::create(Path::new(&args.undo_file)) {
            Ok(log) => log,
            Err(e) => {
                eprintln!("{} Cannot create {}: {}", "✗".red(), args.undo_file, e);
                std::process::exit(1);
            }
        }
    };

    println!("{} Renaming...", "[2/3]".bright_blue().bold());
    let mut report = RunReport::default();
    let mut fatal: Option<FatalError> = None;
    for (key, group) in &groups {
        if let Err(e) = process_group(key, group, &mut undo, args.dry_run, &mut report) {
            fatal = Some(e);
            break;
        }
    }

    // Closed on every exit path, fatal ones included.
    if let Err(e) = undo.close() {
        eprintln!("{} Failed to flush undo log: {}", "✗".red(), e);
    }

    if let Some(e) = fatal {
        println!();
        eprintln!("{} {}", "✗".red().bold(), e.to_string().red());
        std::process::exit(1);
    }
    println!();

    println!("{} Report", "[3/3]".bright_blue().bold());
    print_report(&report);

    let elapsed = start.elapsed();
    println!();
    println!("{}", "═".repeat(60).bright_black());
    println!();
    println!(
        "{} {:.1}s",
        "Completed in:".white().bold(),
        elapsed.as_secs_f64()
    );
    if args.dry_run {
        println!("  {} {}", "Would rename:".cyan(), report.renamed_files);
    } else {
        println!("  {} {}", "Renamed files:".green(), report.renamed_files);
    }
    println!("  {} {}", "Renamed groups:".green(), report.renamed_groups);
    println!(
        "  {} {}",
        "Skipped groups:".bright_black(),
        report.skipped_groups
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
