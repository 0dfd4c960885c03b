use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use background_geolocation::bridge::RecordingBridge;
use background_geolocation::normalizer::split_task;
use background_geolocation::session::{FailureCallback, GeofenceHandler, LocationHandler, LocationsHandler};
use background_geolocation::{Action, BackgroundGeolocation, BackgroundTask, Config, TaskId, TaskOutcome};
use clap::Parser;
use flate2::read::GzDecoder;
use serde::Deserialize;
use serde_json::Value;

#[derive(Parser, Debug)]
struct Args {
    /// Captured native deliveries, one JSON object per line (.jsonl or .jsonl.gz)
    #[arg(long)]
    events: PathBuf,

    /// JSON config handed to configure
    #[arg(long)]
    config: Option<PathBuf>,

    /// Wire action whose handler returns an error (repeatable)
    #[arg(long)]
    fail_on: Vec<String>,

    /// Wire action whose handler panics (repeatable)
    #[arg(long)]
    panic_on: Vec<String>,
}

#[derive(Deserialize)]
struct CapturedDelivery {
    action: String,
    #[serde(default)]
    payload: Value,
    /// false replays a plugin failure instead of a result
    #[serde(default = "default_ok")]
    ok: bool,
}

fn default_ok() -> bool {
    true
}

#[derive(Debug, Clone, Copy)]
enum Behavior {
    Finish,
    Fail,
    Panic,
}

fn respond(action: Action, behavior: Behavior, task: &BackgroundTask) -> anyhow::Result<()> {
    match behavior {
        Behavior::Finish => {
            task.finish()?;
            Ok(())
        }
        Behavior::Fail => anyhow::bail!("replay: forced failure on {}", action.as_str()),
        Behavior::Panic => panic!("replay: forced panic on {}", action.as_str()),
    }
}

fn location_printer(action: Action, behavior: Behavior) -> LocationHandler {
    Box::new(move |location, task| {
        println!("{} [{}] {}", action.as_str(), task.id(), serde_json::to_string(&location)?);
        respond(action, behavior, &task)
    })
}

fn locations_printer(action: Action, behavior: Behavior) -> LocationsHandler {
    Box::new(move |locations, task| {
        println!("{} [{}] {} location(s)", action.as_str(), task.id(), locations.len());
        for location in &locations {
            println!("  {}", serde_json::to_string(location)?);
        }
        respond(action, behavior, &task)
    })
}

fn geofence_printer(behavior: Behavior) -> GeofenceHandler {
    Box::new(move |event, task| {
        println!(
            "{} [{}] {} {:?}",
            Action::OnGeofence.as_str(),
            task.id(),
            event.identifier,
            event.action
        );
        respond(Action::OnGeofence, behavior, &task)
    })
}

fn failure_printer(action: Action) -> FailureCallback {
    Box::new(move |payload| println!("{} failed: {}", action.as_str(), payload))
}

fn parse_behaviors(args: &Args) -> anyhow::Result<HashMap<Action, Behavior>> {
    let mut behaviors = HashMap::new();
    for (names, behavior) in [(&args.fail_on, Behavior::Fail), (&args.panic_on, Behavior::Panic)] {
        for name in names {
            let action = Action::parse(name).with_context(|| format!("unknown action '{}'", name))?;
            behaviors.insert(action, behavior);
        }
    }
    Ok(behaviors)
}

fn load_deliveries(path: &Path) -> anyhow::Result<Vec<CapturedDelivery>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader: Box<dyn Read> = if path.extension().map(|e| e == "gz").unwrap_or(false) {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };

    let mut deliveries = Vec::new();
    for (index, line) in BufReader::new(reader).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let delivery = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: malformed delivery", path.display(), index + 1))?;
        deliveries.push(delivery);
    }
    Ok(deliveries)
}

/// Per task id, how many deliveries outnumber their acknowledgments.
/// Counted per delivery so repeated sentinel ids are not merged.
fn unacknowledged(
    delivered: &[TaskId],
    acknowledgments: &[(TaskId, TaskOutcome)],
) -> Vec<(TaskId, usize)> {
    let mut outstanding: BTreeMap<&TaskId, isize> = BTreeMap::new();
    for task_id in delivered {
        *outstanding.entry(task_id).or_default() += 1;
    }
    for (task_id, _) in acknowledgments {
        *outstanding.entry(task_id).or_default() -= 1;
    }
    outstanding
        .into_iter()
        .filter(|(_, count)| *count > 0)
        .map(|(task_id, count)| (task_id.clone(), count as usize))
        .collect()
}

fn main() -> anyhow::Result<()> {
    background_geolocation::logging::init();
    let args = Args::parse();

    let behaviors = parse_behaviors(&args)?;
    let behavior = |action: Action| behaviors.get(&action).copied().unwrap_or(Behavior::Finish);
    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::new(),
    };

    let bridge = Arc::new(RecordingBridge::new());
    let session = BackgroundGeolocation::new(bridge.clone());

    session.configure(
        config,
        Some(location_printer(Action::Configure, behavior(Action::Configure))),
        Some(failure_printer(Action::Configure)),
    )?;
    session.on_stationary(
        Some(location_printer(
            Action::AddStationaryRegionListener,
            behavior(Action::AddStationaryRegionListener),
        )),
        Some(failure_printer(Action::AddStationaryRegionListener)),
    )?;
    session.on_geofence(
        geofence_printer(behavior(Action::OnGeofence)),
        Some(failure_printer(Action::OnGeofence)),
    )?;

    let mut delivered = Vec::new();
    for (index, delivery) in load_deliveries(&args.events)?.into_iter().enumerate() {
        let action = Action::parse(&delivery.action)
            .with_context(|| format!("delivery {}: unknown action '{}'", index + 1, delivery.action))?;

        match action {
            Action::GetLocations => session.get_locations(
                locations_printer(action, behavior(action)),
                Some(failure_printer(action)),
            )?,
            Action::Sync => session.sync(
                locations_printer(action, behavior(action)),
                Some(failure_printer(action)),
            )?,
            Action::Configure | Action::AddStationaryRegionListener | Action::OnGeofence => {}
            other => anyhow::bail!(
                "delivery {}: '{}' does not open background tasks",
                index + 1,
                other.as_str()
            ),
        }

        if delivery.ok {
            let (task_id, _) = split_task(delivery.payload.clone());
            delivered.push(task_id);
            bridge.succeed(action, delivery.payload)?;
        } else {
            bridge.fail(action, delivery.payload)?;
        }
    }

    let acknowledgments = bridge.acknowledgments()?;
    println!("--- acknowledgments ---");
    for (task_id, outcome) in &acknowledgments {
        match outcome {
            TaskOutcome::Finished => println!("{} finished", task_id),
            TaskOutcome::Failed(message) => println!("{} error: {}", task_id, message),
        }
    }

    let orphaned = unacknowledged(&delivered, &acknowledgments);
    if orphaned.is_empty() {
        println!("all {} task(s) acknowledged", delivered.len());
    } else {
        for (task_id, missing) in &orphaned {
            println!("unacknowledged: {} (x{})", task_id, missing);
        }
        let total: usize = orphaned.iter().map(|(_, missing)| missing).sum();
        log::warn!("{} task(s) left unacknowledged", total);
    }

    Ok(())
}
