//! Single-frame capture for debugging tools.
//!
//! A capture is requested at any time and covers the next complete frame:
//! guest register writes and requests in order, plus the host command lists
//! that were submitted for it.

use serde::Serialize;

use crate::cmd::CommandList;
use crate::xenos::PrimitiveType;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TraceEvent {
    RegisterWrite {
        index: u32,
        value: u32,
    },
    Draw {
        primitive: PrimitiveType,
        index_count: u32,
        indexed: bool,
        drawn: bool,
    },
    Copy {
        resolved: bool,
    },
    Swap {
        frontbuffer: u32,
        width: u32,
        height: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameTrace {
    pub frame: u64,
    pub events: Vec<TraceEvent>,
    pub command_lists: Vec<CommandList>,
}

impl FrameTrace {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Default)]
enum State {
    #[default]
    Idle,
    /// Waiting for the next frame to open. Holds what the guest sent since
    /// the last frame ended.
    Armed(Vec<TraceEvent>),
    Capturing(FrameTrace),
}

#[derive(Debug, Default)]
pub struct FrameTraceRecorder {
    state: State,
    finished: Option<FrameTrace>,
}

impl FrameTraceRecorder {
    pub fn request(&mut self) {
        if matches!(self.state, State::Idle) {
            self.state = State::Armed(Vec::new());
        }
    }

    pub fn is_capturing(&self) -> bool {
        matches!(self.state, State::Capturing(_))
    }

    pub fn record(&mut self, event: TraceEvent) {
        match &mut self.state {
            State::Idle => {}
            State::Armed(events) => events.push(event),
            State::Capturing(trace) => trace.events.push(event),
        }
    }

    pub fn begin_frame(&mut self, frame: u64) {
        if let State::Armed(events) = &mut self.state {
            let events = std::mem::take(events);
            self.state = State::Capturing(FrameTrace {
                frame,
                events,
                command_lists: Vec::new(),
            });
        }
    }

    pub fn end_frame<'a>(&mut self, submitted: impl IntoIterator<Item = &'a CommandList>) {
        match &mut self.state {
            State::Idle => {}
            // Armed mid-frame: what was seen so far belongs to a frame that
            // is not captured.
            State::Armed(events) => events.clear(),
            State::Capturing(_) => {
                if let State::Capturing(mut trace) = std::mem::take(&mut self.state) {
                    trace.command_lists = submitted.into_iter().cloned().collect();
                    self.finished = Some(trace);
                }
            }
        }
    }

    pub fn take(&mut self) -> Option<FrameTrace> {
        self.finished.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_covers_exactly_one_frame() {
        let mut recorder = FrameTraceRecorder::default();
        recorder.record(TraceEvent::RegisterWrite { index: 1, value: 1 });
        recorder.request();
        recorder.record(TraceEvent::RegisterWrite { index: 2, value: 2 });
        recorder.begin_frame(7);
        recorder.record(TraceEvent::Copy { resolved: true });
        let list = CommandList::new("draw");
        recorder.end_frame([&list]);
        recorder.record(TraceEvent::Copy { resolved: false });

        let trace = recorder.take().unwrap();
        assert_eq!(trace.frame, 7);
        assert_eq!(
            trace.events,
            vec![
                TraceEvent::RegisterWrite { index: 2, value: 2 },
                TraceEvent::Copy { resolved: true },
            ]
        );
        assert_eq!(trace.command_lists.len(), 1);
        assert!(recorder.take().is_none());
        assert!(trace.to_json().unwrap().contains("\"frame\":7"));
    }
}
