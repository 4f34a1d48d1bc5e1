//! Step progress rendering
//!
//! A render thread owns the terminal line and redraws
//! ` \- Progress N/total [███|.....]` in place. The pipeline only holds a
//! [`ProgressHandle`] (a channel sender) and reports completed steps through
//! it, so a slow terminal never blocks a control-plane call.

use crate::error::{RescueError, Result};
use crossterm::cursor::MoveToColumn;
use crossterm::queue;
use crossterm::style::Print;
use crossterm::terminal::{Clear, ClearType};
use std::io::{self, Write};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::debug;

/// Bar width in cells
pub const BAR_WIDTH: usize = 60;

const SPINNER: [char; 5] = ['-', '|', '/', '|', '\\'];
const FILLED: char = '█';
const REDRAW_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
enum ProgressEvent {
    Advance,
    Finish,
    Abort,
}

/// Format one frame of the progress line.
pub fn render_bar(count: usize, total: usize, spinner: char) -> String {
    let filled = if total == 0 {
        BAR_WIDTH
    } else {
        BAR_WIDTH * count.min(total) / total
    };
    let head = if count >= total { FILLED } else { spinner };
    format!(
        " \\- Progress {}/{} [{}{}{}]",
        count,
        total,
        FILLED.to_string().repeat(filled),
        head,
        ".".repeat(BAR_WIDTH - filled)
    )
}

/// Sender side used by the pipeline.
#[derive(Debug, Clone)]
pub struct ProgressHandle {
    sender: Option<Sender<ProgressEvent>>,
}

impl ProgressHandle {
    /// A handle that reports nowhere.
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    /// Report one completed step.
    pub fn advance(&self) {
        if let Some(sender) = &self.sender {
            // Render thread gone means there is nothing left to draw on
            let _ = sender.send(ProgressEvent::Advance);
        }
    }
}

/// Owns the render thread.
pub struct ProgressTracker {
    sender: Sender<ProgressEvent>,
    handle: JoinHandle<io::Result<()>>,
}

impl ProgressTracker {
    /// Spawn the render thread drawing to `writer`.
    pub fn start<W>(total: usize, mut writer: W) -> Result<Self>
    where
        W: Write + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("progress".to_string())
            .spawn(move || {
                let mut count = 0usize;
                let mut frame = 0usize;
                let completed = loop {
                    match receiver.recv_timeout(REDRAW_INTERVAL) {
                        Ok(ProgressEvent::Advance) => count = (count + 1).min(total),
                        Ok(ProgressEvent::Finish) | Err(RecvTimeoutError::Disconnected) => {
                            break true;
                        }
                        Ok(ProgressEvent::Abort) => break false,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                    let spinner = SPINNER[frame % SPINNER.len()];
                    draw(&mut writer, &render_bar(count, total, spinner))?;
                    frame += 1;
                };
                if completed {
                    draw(&mut writer, &render_bar(total, total, FILLED))?;
                }
                writeln!(writer)?;
                writer.flush()
            })
            .map_err(|_| RescueError::BackgroundTask("progress".to_string()))?;

        debug!("progress tracker started for {} steps", total);
        Ok(Self { sender, handle })
    }

    pub fn handle(&self) -> ProgressHandle {
        ProgressHandle {
            sender: Some(self.sender.clone()),
        }
    }

    /// Drive the bar to completion and wait for the render thread.
    pub fn finish(self) -> Result<()> {
        self.stop(ProgressEvent::Finish)
    }

    /// Leave the bar where it is (a step failed) and wait for the render thread.
    pub fn abort(self) -> Result<()> {
        self.stop(ProgressEvent::Abort)
    }

    /// Finish or abort depending on the run outcome. Rendering failures are
    /// only logged: the terminal line is cosmetic.
    pub fn close(self, succeeded: bool) {
        let rendered = if succeeded { self.finish() } else { self.abort() };
        if let Err(e) = rendered {
            debug!("progress rendering failed: {}", e);
        }
    }

    fn stop(self, event: ProgressEvent) -> Result<()> {
        let _ = self.sender.send(event);
        match self.handle.join() {
            Ok(result) => Ok(result?),
            Err(_) => Err(RescueError::BackgroundTask("progress".to_string())),
        }
    }
}

fn draw<W: Write>(writer: &mut W, line: &str) -> io::Result<()> {
    queue!(
        writer,
        MoveToColumn(0),
        Clear(ClearType::CurrentLine),
        Print(line)
    )?;
    writer.flush()
}
