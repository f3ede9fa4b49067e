use chrono::{DateTime, Local};
use clap::Parser;
use log::{debug, error, info, warn};
use std::{collections::HashMap, path::PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use towerwatch::{
    analysis::{
        analyzer::{AnomalyEvent, ReportMetadata, Severity},
        engine::{Engine, EngineConfig},
        threat::ThreatSummary,
    },
    observation::ObservationRecord,
    store::{MemoryEventLog, MemoryTowerStore},
};
use walkdir::WalkDir;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    #[arg(
        short = 'p',
        long,
        help = "A file or directory of NDJSON observation feeds"
    )]
    path: PathBuf,

    #[arg(long, help = "Show why some observations were skipped during analysis")]
    show_skipped: bool,

    #[arg(short, long, help = "Only print warnings/errors to stdout")]
    quiet: bool,

    #[arg(short, long, help = "Show debug messages")]
    debug: bool,

    #[arg(long, value_enum, default_value = "text", help = "Output format")]
    format: OutputFormat,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

trait Reporter {
    fn process_events(&mut self, timestamp: DateTime<Local>, events: Vec<AnomalyEvent>);
    fn skip(&mut self, reason: String);
    fn finish(&mut self, threat: Option<ThreatSummary>);
}

struct TextReporter {
    skipped_reasons: HashMap<String, u32>,
    total_observations: u32,
    warnings: u32,
    skipped: u32,
    file_path: String,
    show_skipped: bool,
}

impl TextReporter {
    fn new(file_path: &str, show_skipped: bool) -> Self {
        TextReporter {
            file_path: file_path.to_string(),
            skipped_reasons: HashMap::new(),
            total_observations: 0,
            warnings: 0,
            skipped: 0,
            show_skipped,
        }
    }
}

impl Reporter for TextReporter {
    fn process_events(&mut self, timestamp: DateTime<Local>, events: Vec<AnomalyEvent>) {
        self.total_observations += 1;
        for event in events {
            match event.severity {
                Severity::Informational => {
                    info!("{}: INFO - {} {}", self.file_path, timestamp, event.message);
                }
                _ => {
                    warn!(
                        "{}: WARNING (Severity: {}) - {} {}",
                        self.file_path, event.severity, timestamp, event.message,
                    );
                    self.warnings += 1;
                }
            }
        }
    }

    fn skip(&mut self, reason: String) {
        self.total_observations += 1;
        self.skipped += 1;
        *self.skipped_reasons.entry(reason).or_insert(0) += 1;
    }

    fn finish(&mut self, threat: Option<ThreatSummary>) {
        if self.show_skipped && self.skipped > 0 {
            info!("{}: observations skipped:", self.file_path);
            for (reason, count) in self.skipped_reasons.iter() {
                info!("    - {count}: \"{reason}\"");
            }
        }
        info!(
            "{}: {} observations analyzed, {} warnings, {} observations skipped",
            self.file_path, self.total_observations, self.warnings, self.skipped
        );
        if let Some(threat) = threat {
            let line = format!(
                "{}: final threat level {} ({}) from {} events",
                self.file_path,
                threat.level.level(),
                threat.level,
                threat.contributing_event_count
            );
            if threat.is_alarming() {
                warn!("{line}");
            } else {
                info!("{line}");
            }
        }
    }
}

struct JsonReporter {
    events: Vec<AnomalyEvent>,
    metadata: ReportMetadata,
}

impl JsonReporter {
    fn new(metadata: ReportMetadata) -> Self {
        JsonReporter {
            events: Vec::new(),
            metadata,
        }
    }
}

impl Reporter for JsonReporter {
    fn process_events(&mut self, _timestamp: DateTime<Local>, events: Vec<AnomalyEvent>) {
        self.events.extend(events);
    }

    fn skip(&mut self, reason: String) {
        debug!("skipped: {reason}");
    }

    fn finish(&mut self, _threat: Option<ThreatSummary>) {
        // metadata first, then one event per line
        match serde_json::to_string(&self.metadata) {
            Ok(metadata_str) => println!("{metadata_str}"),
            Err(err) => error!("failed to serialize metadata: {err}"),
        }
        for event in &self.events {
            match serde_json::to_string(event) {
                Ok(event_str) => println!("{event_str}"),
                Err(err) => error!("failed to serialize event: {err}"),
            }
        }
    }
}

async fn analyze_feed(
    feed_path: &str,
    show_skipped: bool,
    format: OutputFormat,
) -> Result<(), std::io::Error> {
    let mut engine = Engine::new(
        EngineConfig::default(),
        MemoryTowerStore::default(),
        MemoryEventLog::default(),
    );
    let mut reporter: Box<dyn Reporter> = match format {
        OutputFormat::Text => Box::new(TextReporter::new(feed_path, show_skipped)),
        OutputFormat::Json => Box::new(JsonReporter::new(engine.get_metadata())),
    };

    let file = File::open(feed_path).await?;
    let mut lines = BufReader::new(file).lines();
    let mut last_timestamp = None;
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let record: ObservationRecord = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(err) => {
                reporter.skip(format!("malformed record: {err}"));
                continue;
            }
        };
        let timestamp = record.timestamp();
        match engine.process(record) {
            Ok(events) => {
                last_timestamp = Some(match last_timestamp {
                    Some(last) if last > timestamp => last,
                    _ => timestamp,
                });
                reporter.process_events(timestamp, events);
            }
            Err(err) => reporter.skip(err.to_string()),
        }
    }

    // replayed feeds are historical, so judge the threat as of the last
    // observation rather than the wall clock
    let threat = match last_timestamp {
        Some(at) => match engine.threat(at) {
            Ok(threat) => Some(threat),
            Err(err) => {
                error!("{feed_path}: failed to compute threat level: {err}");
                None
            }
        },
        None => None,
    };
    reporter.finish(threat);
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let level = if args.debug {
        log::LevelFilter::Debug
    } else if args.quiet {
        log::LevelFilter::Warn
    } else {
        log::LevelFilter::Info
    };
    if let Err(err) = simple_logger::SimpleLogger::new()
        .with_colors(true)
        .without_timestamps()
        .with_level(level)
        .init()
    {
        eprintln!("failed to initialize logger: {err}");
    }

    let metadata = Engine::new(
        EngineConfig::default(),
        MemoryTowerStore::default(),
        MemoryEventLog::default(),
    )
    .get_metadata();

    info!("Classifiers:");
    for classifier in &metadata.classifiers {
        info!(
            "    - {} (v{}): {}",
            classifier.name, classifier.version, classifier.description
        );
    }

    for maybe_entry in WalkDir::new(&args.path) {
        let Ok(entry) = maybe_entry else {
            error!("failed to open dir entry {maybe_entry:?}");
            continue;
        };
        let name_str = entry.file_name().to_string_lossy();
        if !entry.file_type().is_file() || !name_str.ends_with(".ndjson") {
            continue;
        }
        let path_str = entry.path().to_string_lossy();
        info!("**** Beginning analysis of {name_str}");
        if let Err(err) = analyze_feed(&path_str, args.show_skipped, args.format).await {
            error!("{path_str}: failed to read feed: {err}");
        }
    }
}
