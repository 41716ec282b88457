//! One-shot offline training.
//!
//! Runs the same orchestrator as `POST /train` against the configured
//! dataset, model directory and database, then exits. The training lock in
//! the model directory is shared with the server, so a run here fails fast
//! while the server is training and the other way round.
//!
//! ```bash
//! snapclass-train                    # Train on every label directory
//! snapclass-train --labels cat,dog   # Train on a subset and migrate it
//! ```

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use snapclass::config::Config;
use snapclass::db::Database;
use snapclass::logging;
use snapclass::prediction::Predictor;
use snapclass::training::{Orchestrator, TrainingStatus};
use snapclass::upload;

#[derive(Debug, Default)]
struct TrainArgs {
    labels: Option<Vec<String>>,
    config_path: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = parse_args();

    let config = match &args.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    logging::init(&config.logging)?;

    let labels = match args.labels {
        Some(labels) => Some(
            labels
                .iter()
                .map(|l| upload::validate_label(l))
                .collect::<Result<Vec<_>, _>>()?,
        ),
        None => None,
    };

    let db = Database::open(&config.storage.db_path)?;
    db.initialize()?;
    info!(path = %config.storage.db_path.display(), "Database opened");

    let predictor = Arc::new(Predictor::load(
        &config.storage.model_path(),
        config.training.target_size,
    ));
    let orchestrator = Orchestrator::new(
        Arc::new(db),
        config.storage.clone(),
        config.training.clone(),
        predictor,
        Arc::new(TrainingStatus::with_lock_file(
            config.storage.training_lock_path(),
        )),
    );

    match orchestrator.run(labels) {
        Ok(outcome) => {
            println!(
                "Trained model {} on {} images ({} labels), validation accuracy {:.3}, migrated {}",
                outcome.model_id,
                outcome.num_images,
                outcome.labels.len(),
                outcome.validation_accuracy,
                outcome.migrated
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Training failed");
            Err(e).context("Training failed")
        }
    }
}

#[derive(Debug)]
enum Command {
    Train(TrainArgs),
    Help,
}

fn parse_args() -> TrainArgs {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match parse_args_from(&args) {
        Ok(Command::Train(parsed)) => parsed,
        Ok(Command::Help) => {
            print_help();
            std::process::exit(0);
        }
        Err(message) => {
            eprintln!("Error: {}", message);
            print_help();
            std::process::exit(1);
        }
    }
}

fn parse_args_from(args: &[String]) -> Result<Command, String> {
    let mut parsed = TrainArgs::default();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--labels" | "-l" => {
                let labels: Vec<String> = args
                    .get(i + 1)
                    .map(|list| {
                        list.split(',')
                            .map(|l| l.trim().to_string())
                            .filter(|l| !l.is_empty())
                            .collect()
                    })
                    .unwrap_or_default();
                if labels.is_empty() {
                    return Err("--labels requires a comma-separated list of labels".to_string());
                }
                parsed.labels = Some(labels);
                i += 1;
            }
            "--config" | "-c" => match args.get(i + 1) {
                Some(path) => {
                    parsed.config_path = Some(PathBuf::from(path));
                    i += 1;
                }
                None => return Err("--config requires a path argument".to_string()),
            },
            "--help" | "-h" => return Ok(Command::Help),
            other => return Err(format!("Unknown argument: {}", other)),
        }
        i += 1;
    }

    Ok(Command::Train(parsed))
}

fn print_help() {
    println!(
        r#"snapclass-train - Train the snapclass classifier once and exit

USAGE:
    snapclass-train [OPTIONS]

OPTIONS:
    --labels, -l A,B    Train only these labels and move them to the trained set
    --config, -c PATH   Path to config file
    --help, -h          Show this help message

ENVIRONMENT:
    SNAPCLASS_CONFIG    Path to config file (overrides default location)
    SNAPCLASS_LOG       Log filter (trace, debug, info, warn, error)

Exits with an error while another run (server or offline) holds the
training lock in the model directory.
"#
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Command, String> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        parse_args_from(&args)
    }

    #[test]
    fn test_parse_labels_and_config() {
        let Ok(Command::Train(parsed)) = parse(&["--labels", "cat, dog,", "-c", "/tmp/c.toml"])
        else {
            panic!("expected train command");
        };
        assert_eq!(parsed.labels, Some(vec!["cat".to_string(), "dog".to_string()]));
        assert_eq!(parsed.config_path, Some(PathBuf::from("/tmp/c.toml")));

        let Ok(Command::Train(parsed)) = parse(&[]) else {
            panic!("expected train command");
        };
        assert!(parsed.labels.is_none());
    }

    #[test]
    fn test_missing_values_are_errors() {
        assert!(parse(&["--labels"]).unwrap_err().contains("--labels"));
        assert!(parse(&["--labels", " , "]).unwrap_err().contains("--labels"));
        assert!(parse(&["--config"]).unwrap_err().contains("--config"));
        assert!(parse(&["--bogus"]).unwrap_err().contains("Unknown argument"));
        assert!(matches!(parse(&["-h"]), Ok(Command::Help)));
    }
}
