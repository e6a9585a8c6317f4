//! `lorasim <scenario.yaml> [events.json] [metrics.json]`
//!
//! Runs a scenario and prints the run statistics as JSON on stdout. The
//! output event stream and a metrics snapshot are written when paths are
//! given.

use lorasim_runner::metrics_export::export_json;
use lorasim_runner::{install_recorder, load_scenario, logging, run_scenario, RunnerError};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

fn main() -> Result<(), RunnerError> {
    logging::init_tracing_with_default("warn");

    let mut args = std::env::args_os().skip(1).map(PathBuf::from);
    let Some(scenario_path) = args.next() else {
        return Err(RunnerError::ConfigError(
            "usage: lorasim <scenario.yaml> [events.json] [metrics.json]".to_string(),
        ));
    };
    let events_path = args.next();
    let metrics_path = args.next();

    let recorder = match metrics_path {
        Some(_) => Some(install_recorder()?),
        None => None,
    };

    let scenario = load_scenario(&scenario_path)?;
    let output: Option<Box<dyn Write>> = match events_path {
        Some(path) => Some(Box::new(BufWriter::new(File::create(path)?))),
        None => None,
    };
    let stats = run_scenario(&scenario, output)?;
    println!("{}", serde_json::to_string_pretty(&stats)?);

    if let (Some(recorder), Some(path)) = (recorder, metrics_path) {
        let mut file = BufWriter::new(File::create(path)?);
        export_json(&recorder.snapshot(), &mut file)?;
        file.flush()?;
    }
    Ok(())
}
