//! Spinner on stderr while waiting on Azure.

use std::io::{IsTerminal, Write};
use std::time::Duration;

use tokio::task::JoinHandle;

const FRAMES: [char; 4] = ['|', '/', '-', '\\'];
const FRAME_INTERVAL: Duration = Duration::from_millis(200);

/// Draws until dropped. Inert when stderr is not a terminal.
pub struct Spinner {
    task: Option<JoinHandle<()>>,
}

impl Spinner {
    pub fn start(label: &'static str) -> Self {
        if !std::io::stderr().is_terminal() {
            return Self::disabled();
        }
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(FRAME_INTERVAL);
            for frame in FRAMES.iter().cycle() {
                interval.tick().await;
                draw(&format!("\r{frame} {label}"));
            }
        });
        Self { task: Some(task) }
    }

    pub fn disabled() -> Self {
        Self { task: None }
    }

    pub fn is_active(&self) -> bool {
        self.task.is_some()
    }
}

fn draw(text: &str) {
    let mut stderr = std::io::stderr().lock();
    let _ = stderr.write_all(text.as_bytes());
    let _ = stderr.flush();
}

impl Drop for Spinner {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            // Erase the spinner line.
            draw("\r\x1b[K");
        }
    }
}
