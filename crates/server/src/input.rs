//! C2: input coalescer. Converts a bursty stream of input tasks into a
//! well-ordered series of injection-tool invocations: pointer moves are
//! coalesced to at most 125 Hz, keys and buttons are never reordered or
//! dropped relative to each other or the move that preceded them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use deskcast_protocol::ScreenState;
use tokio::process::Command;
use tokio::sync::{mpsc, RwLock};

const QUEUE_CAPACITY: usize = 4096;
const MOVE_INTERVAL: Duration = Duration::from_millis(8); // 125 Hz

#[derive(Debug, Clone, PartialEq)]
pub enum InputTask {
    KeyDown(String),
    KeyUp(String),
    Mouse { nx: f64, ny: f64 },
    Button { button: u8, down: bool },
}

pub struct InputCoalescer {
    tx: mpsc::Sender<InputTask>,
}

impl InputCoalescer {
    /// Spawns the worker task and returns a handle. `screen` is read on
    /// every pointer-move dispatch so normalization always uses the
    /// current geometry, not whatever was current when the event arrived.
    pub fn spawn(injector_bin: String, display: String, screen: Arc<RwLock<ScreenState>>) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        tokio::spawn(worker_loop(rx, injector_bin, display, screen));
        Self { tx }
    }

    /// Non-blocking submit; drops the task (soft-drop, logged) if the
    /// queue is full rather than ever blocking the caller.
    pub fn submit(&self, task: InputTask) {
        if self.tx.try_send(task).is_err() {
            tracing::warn!("input queue full, dropping event");
        }
    }
}

async fn worker_loop(
    mut rx: mpsc::Receiver<InputTask>,
    injector_bin: String,
    display: String,
    screen: Arc<RwLock<ScreenState>>,
) {
    let mut deferred: Option<InputTask> = None;
    let mut last_move_dispatch = Instant::now() - MOVE_INTERVAL;

    loop {
        let task = match deferred.take() {
            Some(t) => t,
            None => match rx.recv().await {
                Some(t) => t,
                None => return,
            },
        };

        match task {
            InputTask::Mouse { mut nx, mut ny } => {
                // Drain any further contiguous moves, keeping only the latest
                // — everything in between would never be visible anyway.
                loop {
                    match rx.try_recv() {
                        Ok(InputTask::Mouse { nx: x, ny: y }) => {
                            nx = x;
                            ny = y;
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                let elapsed = last_move_dispatch.elapsed();
                if elapsed < MOVE_INTERVAL {
                    tokio::time::sleep(MOVE_INTERVAL - elapsed).await;
                }
                dispatch_move(&injector_bin, &display, nx, ny, &screen).await;
                last_move_dispatch = Instant::now();
            }
            InputTask::KeyDown(key) => dispatch_key(&injector_bin, &display, &key, true).await,
            InputTask::KeyUp(key) => dispatch_key(&injector_bin, &display, &key, false).await,
            InputTask::Button { button, down } => {
                dispatch_button(&injector_bin, &display, button, down).await
            }
        }
    }
}

/// `^[A-Za-z0-9_-]+$` names and single printable-ASCII characters pass
/// through to the injection tool's own dictionary; anything else is
/// silently dropped rather than forwarded as a best guess.
pub fn is_valid_key_symbol(key: &str) -> bool {
    if key.chars().count() == 1 {
        return key.chars().next().is_some_and(|c| c.is_ascii_graphic() || c == ' ');
    }
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

async fn dispatch_move(
    injector_bin: &str,
    display: &str,
    nx: f64,
    ny: f64,
    screen: &Arc<RwLock<ScreenState>>,
) {
    let state = *screen.read().await;
    let x = (nx.clamp(0.0, 1.0) * state.width as f64).round() as i64;
    let y = (ny.clamp(0.0, 1.0) * state.height as f64).round() as i64;
    let _ = Command::new(injector_bin)
        .env("DISPLAY", display)
        .args(["mousemove", &x.to_string(), &y.to_string()])
        .status()
        .await
        .map_err(|e| tracing::debug!("mousemove injection failed: {e}"));
}

async fn dispatch_key(injector_bin: &str, display: &str, key: &str, down: bool) {
    if !is_valid_key_symbol(key) {
        return;
    }
    let verb = if down { "keydown" } else { "keyup" };
    let _ = Command::new(injector_bin)
        .env("DISPLAY", display)
        .args([verb, key])
        .status()
        .await
        .map_err(|e| tracing::debug!("key injection failed: {e}"));
}

async fn dispatch_button(injector_bin: &str, display: &str, button: u8, down: bool) {
    if button > 2 {
        return;
    }
    let verb = if down { "mousedown" } else { "mouseup" };
    let _ = Command::new(injector_bin)
        .env("DISPLAY", display)
        .args([verb, &button.to_string()])
        .status()
        .await
        .map_err(|e| tracing::debug!("button injection failed: {e}"));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_printable_ascii_key_is_valid() {
        assert!(is_valid_key_symbol("a"));
        assert!(is_valid_key_symbol("5"));
        assert!(is_valid_key_symbol("."));
    }

    #[test]
    fn dictionary_style_name_is_valid() {
        assert!(is_valid_key_symbol("Enter"));
        assert!(is_valid_key_symbol("ArrowUp"));
        assert!(is_valid_key_symbol("F1"));
    }

    #[test]
    fn names_outside_character_class_are_rejected() {
        assert!(!is_valid_key_symbol(""));
        assert!(!is_valid_key_symbol("Arrow Up"));
        assert!(!is_valid_key_symbol("<script>"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn coalescer_submit_never_blocks_when_queue_is_full() {
        let screen = Arc::new(RwLock::new(ScreenState::new(1280, 720)));
        // Don't spawn a worker: drive the channel directly to test drop-on-full.
        let (tx, _rx) = mpsc::channel(1);
        let coalescer = InputCoalescer { tx };
        coalescer.submit(InputTask::Mouse { nx: 0.1, ny: 0.1 });
        // Second submit exceeds capacity 1 with no consumer draining; must not block.
        coalescer.submit(InputTask::Mouse { nx: 0.2, ny: 0.2 });
        let _ = screen;
    }
}
