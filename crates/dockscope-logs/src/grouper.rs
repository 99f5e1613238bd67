use std::time::Duration;

use dockscope_types::{LogEvent, Position};

/// A parsed event waiting to be grouped
#[derive(Clone, Debug)]
pub struct Record {
    pub event: LogEvent,
    /// Whether the classifier found a level in this line itself, as opposed to
    /// one propagated from the start of a group
    detected: bool,
}

impl Record {
    pub fn new(event: LogEvent) -> Self {
        let detected = event.has_level();
        Self { event, detected }
    }

    pub fn into_event(self) -> LogEvent {
        self.event
    }
}

/// Tags runs of related lines (stack traces and the like) using one record of lookahead
///
/// A leveled line followed closely by unleveled lines starts a group. The group
/// continues while lines stay unleveled and close together, and its last line
/// is marked as the end. The starting line's level is copied onto every line
/// inside the group.
#[derive(Clone, Copy, Debug)]
pub struct Grouper {
    window_ms: i64,
}

impl Grouper {
    pub fn new(window: Duration) -> Self {
        Self {
            window_ms: window.as_millis() as i64,
        }
    }

    /// Resolve the position of `current` given the following record, if one is available yet
    pub fn check(&self, current: &mut Record, next: Option<&mut Record>) {
        let Some(next) = next else {
            if current.event.position == Some(Position::Middle) {
                current.event.position = Some(Position::End);
            }
            return;
        };

        let close = current.event.is_close_to(&next.event, self.window_ms);

        if close && current.detected && !next.detected {
            current.event.position = Some(Position::Beginning);
            next.event.position = Some(Position::Middle);
        }

        if current.event.position == Some(Position::Middle) {
            if next.detected || !close {
                current.event.position = Some(Position::End);
            } else {
                next.event.position = Some(Position::Middle);
            }
        }

        if matches!(
            current.event.position,
            Some(Position::Beginning) | Some(Position::Middle)
        ) {
            next.event.level = current.event.level;
        }
    }
}

impl Default for Grouper {
    fn default() -> Self {
        Self::new(Duration::from_millis(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockscope_types::{LogLevel, StdType};

    fn record(ts: i64, level: LogLevel) -> Record {
        let mut event = LogEvent::new(0, String::new(), StdType::Stdout);
        event.timestamp = ts;
        event.level = level;
        Record::new(event)
    }

    /// Run the grouper over a complete sequence the way the generator does
    fn run(mut records: Vec<Record>) -> Vec<LogEvent> {
        let grouper = Grouper::default();
        for i in 0..records.len() {
            let (head, tail) = records.split_at_mut(i + 1);
            grouper.check(&mut head[i], tail.first_mut());
        }
        records.into_iter().map(Record::into_event).collect()
    }

    fn positions(events: &[LogEvent]) -> Vec<Option<Position>> {
        events.iter().map(|e| e.position).collect()
    }

    #[test]
    fn test_group_closed_by_stream_end() {
        let events = run(vec![
            record(1000, LogLevel::Error),
            record(1001, LogLevel::Unknown),
            record(1002, LogLevel::Unknown),
        ]);

        assert_eq!(
            positions(&events),
            vec![
                Some(Position::Beginning),
                Some(Position::Middle),
                Some(Position::End)
            ]
        );
        assert!(events.iter().all(|e| e.level == LogLevel::Error));
    }

    #[test]
    fn test_group_closed_by_leveled_line() {
        let events = run(vec![
            record(1000, LogLevel::Error),
            record(1001, LogLevel::Unknown),
            record(1002, LogLevel::Unknown),
            record(1003, LogLevel::Info),
        ]);

        assert_eq!(
            positions(&events),
            vec![
                Some(Position::Beginning),
                Some(Position::Middle),
                Some(Position::End),
                None
            ]
        );
        assert_eq!(events[2].level, LogLevel::Error);
        assert_eq!(events[3].level, LogLevel::Info);
    }

    #[test]
    fn test_leveled_third_line_ends_pair() {
        let events = run(vec![
            record(1000, LogLevel::Error),
            record(1001, LogLevel::Unknown),
            record(1002, LogLevel::Error),
        ]);

        assert_eq!(
            positions(&events),
            vec![Some(Position::Beginning), Some(Position::End), None]
        );
        assert_eq!(events[1].level, LogLevel::Error);
    }

    #[test]
    fn test_distant_lines_are_not_grouped() {
        let events = run(vec![
            record(1000, LogLevel::Error),
            record(1050, LogLevel::Unknown),
        ]);

        assert_eq!(positions(&events), vec![None, None]);
        assert_eq!(events[1].level, LogLevel::Unknown);
    }

    #[test]
    fn test_gap_inside_group_ends_it() {
        let events = run(vec![
            record(1000, LogLevel::Warn),
            record(1001, LogLevel::Unknown),
            record(2000, LogLevel::Unknown),
        ]);

        assert_eq!(
            positions(&events),
            vec![Some(Position::Beginning), Some(Position::End), None]
        );
        assert_eq!(events[2].level, LogLevel::Unknown);
    }

    #[test]
    fn test_unleveled_start_does_not_group() {
        let events = run(vec![
            record(1000, LogLevel::Unknown),
            record(1001, LogLevel::Unknown),
        ]);
        assert_eq!(positions(&events), vec![None, None]);
    }

    #[test]
    fn test_configurable_window() {
        let grouper = Grouper::new(Duration::from_secs(1));
        let mut first = record(1000, LogLevel::Error);
        let mut second = record(1500, LogLevel::Unknown);
        grouper.check(&mut first, Some(&mut second));

        assert_eq!(first.event.position, Some(Position::Beginning));
        assert_eq!(second.event.position, Some(Position::Middle));
    }
}
