//! Concurrent fan-out of a unit of work across cluster nodes, with a live
//! in-place status display.
//!
//! Each unit runs on the blocking pool (remote I/O is blocking) and reports
//! completion over a channel. A separately spawned renderer redraws the
//! status block on a fixed tick until it is cancelled, always in node-index
//! order regardless of completion order. A failing unit never cancels its
//! siblings; failures are aggregated and returned once the whole batch has
//! finished.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const TICK: Duration = Duration::from_millis(100);
const SPINNER: [char; 4] = ['|', '/', '-', '\\'];

const PROGRESS_DONE: &str = "=======================================>";
const PROGRESS_TODO: &str = "----------------------------------------";

/// Render a 40-cell progress bar for a fraction in `[0, 1]`.
pub fn format_progress(p: f64) -> String {
    let p = p.clamp(0.0, 1.0);
    let i = (PROGRESS_DONE.len() as f64 * (1.0 - p)).ceil() as usize;
    format!(
        "[{}{}] {:.0}%",
        &PROGRESS_DONE[i..],
        &PROGRESS_TODO[..i],
        100.0 * p
    )
}

#[derive(Clone)]
enum UnitState {
    Pending,
    Progress(f64),
    Done,
    Failed(String),
}

/// Handle passed to each unit for reporting transfer progress; progress is
/// drawn as a percentage bar in place of the busy spinner.
#[derive(Clone)]
pub struct Progress {
    states: Arc<Mutex<Vec<UnitState>>>,
    index: usize,
}

impl Progress {
    pub fn update(&self, fraction: f64) {
        let mut states = self.states.lock().expect("status lock poisoned");
        states[self.index] = UnitState::Progress(fraction);
    }
}

/// Run `unit(i)` once per name, concurrently, rendering a live status block
/// headed by `label`. Returns the unit outputs in index order, or an error
/// enumerating every failed unit once all units have finished.
pub async fn parallel<T, F>(label: &str, names: &[String], unit: F) -> Result<Vec<T>>
where
    T: Send + 'static,
    F: Fn(usize, Progress) -> Result<T> + Send + Sync + 'static,
{
    let total = names.len();
    let states = Arc::new(Mutex::new(vec![UnitState::Pending; total]));
    let unit = Arc::new(unit);

    let (tx, mut rx) = mpsc::unbounded_channel();
    for index in 0..total {
        let tx = tx.clone();
        let unit = Arc::clone(&unit);
        let progress = Progress {
            states: Arc::clone(&states),
            index,
        };
        tokio::task::spawn_blocking(move || {
            let result = unit(index, progress);
            let _ = tx.send((index, result));
        });
    }
    drop(tx);

    let cancel = CancellationToken::new();
    let renderer = tokio::spawn(render_loop(
        label.to_string(),
        names.to_vec(),
        Arc::clone(&states),
        cancel.clone(),
    ));

    let mut outputs: Vec<Option<T>> = (0..total).map(|_| None).collect();
    let mut failures: Vec<(usize, String)> = Vec::new();
    while let Some((index, result)) = rx.recv().await {
        let mut states = states.lock().expect("status lock poisoned");
        match result {
            Ok(output) => {
                states[index] = UnitState::Done;
                outputs[index] = Some(output);
            }
            Err(err) => {
                let msg = format!("{err:#}");
                states[index] = UnitState::Failed(msg.clone());
                failures.push((index, msg));
            }
        }
    }
    cancel.cancel();
    let _ = renderer.await;

    if !failures.is_empty() {
        failures.sort_by_key(|(index, _)| *index);
        let list = failures
            .iter()
            .map(|(index, err)| format!("  {:>2}: {err}", names[*index]))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("{label}: {}/{total} units failed:\n{list}", failures.len());
    }
    Ok(outputs.into_iter().flatten().collect())
}

async fn render_loop(
    label: String,
    names: Vec<String>,
    states: Arc<Mutex<Vec<UnitState>>>,
    cancel: CancellationToken,
) {
    let mut ui = StatusWriter::default();
    let mut ticker = tokio::time::interval(TICK);
    let mut spin = 0usize;
    loop {
        let last = tokio::select! {
            _ = ticker.tick() => false,
            _ = cancel.cancelled() => true,
        };
        let frame = {
            let states = states.lock().expect("status lock poisoned");
            render_frame(&label, &names, &states, SPINNER[spin % SPINNER.len()])
        };
        ui.flush(&frame);
        spin += 1;
        // Failed and completed lines stay visible in the final frame.
        if last {
            break;
        }
    }
}

fn render_frame(label: &str, names: &[String], states: &[UnitState], spinner: char) -> String {
    let done = states
        .iter()
        .filter(|s| matches!(s, UnitState::Done | UnitState::Failed(_)))
        .count();
    let mut frame = format!("{label} {done}/{}\n", states.len());
    for (name, state) in names.iter().zip(states) {
        let status = match state {
            UnitState::Pending => spinner.to_string(),
            UnitState::Progress(p) => format_progress(*p),
            UnitState::Done => "done".to_string(),
            UnitState::Failed(err) => err.lines().next().unwrap_or("failed").to_string(),
        };
        frame.push_str(&format!("  {name:>2}: {status}\n"));
    }
    frame
}

/// Rewrites a block of terminal lines in place: each flush moves the cursor
/// back over the previously written block and redraws every line.
#[derive(Default)]
struct StatusWriter {
    lines: usize,
}

impl StatusWriter {
    fn flush(&mut self, block: &str) {
        let mut out = io::stdout().lock();
        if self.lines > 0 {
            let _ = write!(out, "\x1b[{}F", self.lines);
        }
        for line in block.lines() {
            let _ = writeln!(out, "\x1b[2K{line}");
        }
        self.lines = block.lines().count();
        let _ = out.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(n: usize) -> Vec<String> {
        (1..=n).map(|i| i.to_string()).collect()
    }

    #[tokio::test]
    async fn all_units_succeed() {
        let out = parallel("test: noop", &names(8), |i, _| Ok(i * 2))
            .await
            .unwrap();
        assert_eq!(out, vec![0, 2, 4, 6, 8, 10, 12, 14]);
    }

    #[tokio::test]
    async fn failures_are_enumerated_in_index_order() {
        let err = parallel("test: partial", &names(5), |i, _| {
            // Finish out of index order to check the aggregate is ordered.
            std::thread::sleep(Duration::from_millis(50 - 10 * i as u64));
            if i % 2 == 1 {
                anyhow::bail!("unit {i} broke")
            }
            Ok(())
        })
        .await
        .unwrap_err();

        let msg = format!("{err}");
        assert!(msg.contains("2/5 units failed"), "{msg}");
        assert!(msg.contains("2: unit 1 broke"), "{msg}");
        assert!(msg.contains("4: unit 3 broke"), "{msg}");
        assert!(!msg.contains("unit 0"), "{msg}");
        assert!(!msg.contains("unit 2 broke"), "{msg}");
    }

    #[tokio::test]
    async fn failing_units_do_not_cancel_siblings() {
        let ran = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&ran);
        let err = parallel("test: one bad", &names(6), move |i, _| {
            *counter.lock().unwrap() += 1;
            if i == 0 {
                anyhow::bail!("first unit fails fast")
            }
            std::thread::sleep(Duration::from_millis(20));
            Ok(())
        })
        .await
        .unwrap_err();

        assert_eq!(*ran.lock().unwrap(), 6);
        assert!(format!("{err}").contains("1/6 units failed"));
    }

    #[tokio::test]
    async fn progress_updates_are_per_unit() {
        let out = parallel("test: progress", &names(3), |i, progress| {
            progress.update(i as f64 / 4.0);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn progress_bar_endpoints() {
        assert_eq!(
            format_progress(0.0),
            format!("[{PROGRESS_TODO}] 0%"),
        );
        assert_eq!(
            format_progress(1.0),
            format!("[{PROGRESS_DONE}] 100%"),
        );
        assert!(format_progress(0.5).ends_with("50%"));
        // Out-of-range fractions clamp instead of slicing out of bounds.
        assert!(format_progress(1.5).ends_with("100%"));
        assert!(format_progress(-0.5).ends_with("0%"));
    }
}
