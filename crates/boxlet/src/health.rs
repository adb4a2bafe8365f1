//! Health status of a proxy and its worker groups.

use serde::{Deserialize, Serialize};

use crate::group::GroupOccupancy;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Health {
    /// No worker has connected yet
    #[default]
    Starting,
    /// Every group is at full strength with room for work
    Ready,
    /// Every worker is busy
    Busy,
    /// Some group runs below its configured size (worker lost, respawn pending)
    Degraded,
    /// Draining before exit
    ShuttingDown,
}

impl Health {
    pub fn assess<'a>(
        shutting_down: bool,
        groups: impl IntoIterator<Item = &'a GroupOccupancy>,
    ) -> Self {
        if shutting_down {
            return Self::ShuttingDown;
        }
        let (mut workers, mut idle, mut short) = (0, 0, false);
        for group in groups {
            workers += group.workers;
            idle += group.idle;
            short |= group.workers < group.configured;
        }
        if workers == 0 {
            Self::Starting
        } else if short {
            Self::Degraded
        } else if idle == 0 {
            Self::Busy
        } else {
            Self::Ready
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn occ(workers: usize, configured: usize, idle: usize) -> GroupOccupancy {
        GroupOccupancy {
            workers,
            configured,
            idle,
            waiting: 0,
        }
    }

    #[test]
    fn health_default_is_starting() {
        assert_eq!(Health::default(), Health::Starting);
    }

    #[test]
    fn assess_covers_each_state() {
        assert_eq!(Health::assess(true, &[occ(2, 2, 2)]), Health::ShuttingDown);
        assert_eq!(Health::assess(false, &[occ(0, 2, 0)]), Health::Starting);
        assert_eq!(Health::assess(false, &[occ(1, 2, 1)]), Health::Degraded);
        assert_eq!(Health::assess(false, &[occ(2, 2, 0), occ(1, 1, 0)]), Health::Busy);
        assert_eq!(Health::assess(false, &[occ(2, 2, 0), occ(1, 1, 1)]), Health::Ready);
    }

    #[test]
    fn health_serializes_screaming_snake_case() {
        insta::assert_json_snapshot!(
            [Health::Starting, Health::Ready, Health::Busy, Health::Degraded, Health::ShuttingDown],
            @r#"
        [
          "STARTING",
          "READY",
          "BUSY",
          "DEGRADED",
          "SHUTTING_DOWN"
        ]
        "#
        );
    }
}
