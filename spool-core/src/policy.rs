// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{fmt, str::FromStr};

/// Decides what a bounded per-key queue does with a new message when it is already at capacity.
///
/// | Policy | Behavior on full |
/// |---|---|
/// | [`DropNew`](Self::DropNew) | the incoming message is failed |
/// | [`DropHead`](Self::DropHead) | the oldest queued message is failed, then the insert is retried |
/// | [`DropTail`](Self::DropTail) | the newest queued message is failed, then the insert is retried |
/// | [`DropBuffer`](Self::DropBuffer) | the whole queue is failed, then the insert is retried |
/// | [`Fail`](Self::Fail) | the insert is rejected synchronously with a capacity error |
/// | [`BackPressure`](Self::BackPressure) | the producer blocks until the queue drops below capacity |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum OverflowPolicy {
    /// Drops the oldest element to make space for the new one. More recent messages are usually more valuable.
    #[default]
    DropHead,
    /// Drops the youngest element already in the queue to make space for the new one.
    DropTail,
    /// Drops every buffered element to make space for the new one.
    DropBuffer,
    /// Drops the new element.
    DropNew,
    /// Blocks the producer until space becomes available.
    BackPressure,
    /// Rejects the new element with an error returned to the producer.
    Fail,
}

impl OverflowPolicy {
    pub const ALL: [OverflowPolicy; 6] = [
        Self::DropHead,
        Self::DropTail,
        Self::DropBuffer,
        Self::DropNew,
        Self::BackPressure,
        Self::Fail,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::DropHead => "DropHead",
            Self::DropTail => "DropTail",
            Self::DropBuffer => "DropBuffer",
            Self::DropNew => "DropNew",
            Self::BackPressure => "BackPressure",
            Self::Fail => "Fail",
        }
    }

    /// Returns true if producers may block on a full queue.
    pub fn is_back_pressure(self) -> bool {
        self == Self::BackPressure
    }

    /// Returns true if applying the policy can fail messages that were already accepted.
    pub fn evicts_queued(self) -> bool {
        matches!(self, Self::DropHead | Self::DropTail | Self::DropBuffer)
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when parsing an unknown policy name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownPolicy(String);

impl fmt::Display for UnknownPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown overflow policy `{}`", self.0)
    }
}

impl std::error::Error for UnknownPolicy {}

impl FromStr for OverflowPolicy {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|policy| policy.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownPolicy(s.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("DropHead", OverflowPolicy::DropHead)]
    #[case("droptail", OverflowPolicy::DropTail)]
    #[case("DROPBUFFER", OverflowPolicy::DropBuffer)]
    #[case("dropNew", OverflowPolicy::DropNew)]
    #[case("backpressure", OverflowPolicy::BackPressure)]
    #[case("fail", OverflowPolicy::Fail)]
    fn parses_names(#[case] name: &str, #[case] expected: OverflowPolicy) {
        assert_eq!(name.parse::<OverflowPolicy>().unwrap(), expected);
        assert_eq!(
            expected.to_string().parse::<OverflowPolicy>().unwrap(),
            expected
        );
    }

    #[test]
    fn rejects_unknown_names() {
        let err = "drop-everything".parse::<OverflowPolicy>().unwrap_err();
        assert_eq!(err.to_string(), "unknown overflow policy `drop-everything`");
    }

    #[test]
    fn only_back_pressure_blocks() {
        let blocking: Vec<_> = OverflowPolicy::ALL
            .into_iter()
            .filter(|p| p.is_back_pressure())
            .collect();
        assert_eq!(blocking, [OverflowPolicy::BackPressure]);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn serializes_as_name() {
        assert_eq!(
            serde_json::to_string(&OverflowPolicy::DropTail).unwrap(),
            "\"DropTail\""
        );
    }
}
