use strum::{AsRefStr, Display, EnumString};

/// Text messages on the `events` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ControlEvent {
    /// Hold the scheduler at the next round boundary.
    Pause,
    Resume,
    /// Abandon the current round and wipe all round-scoped state.
    Reset,
    /// Published by the scheduler after each committed round.
    RoundFinish,
}

impl ControlEvent {
    pub fn to_bytes(self) -> Vec<u8> {
        self.as_ref().as_bytes().to_vec()
    }

    /// Parses a raw channel message, tolerating surrounding whitespace.
    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        std::str::from_utf8(raw).ok()?.trim().parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use assertor::{assert_that, EqualityAssertion, OptionAssertion};

    use super::ControlEvent;

    #[test]
    fn wire_text() {
        assert_that!(ControlEvent::RoundFinish.to_string()).is_equal_to("round_finish".to_string());
        assert_that!(ControlEvent::Pause.to_bytes()).is_equal_to(b"pause".to_vec());
    }

    #[test]
    fn parse_with_newline() {
        // given
        let raw = b"reset\n";

        // when
        let parsed = ControlEvent::from_bytes(raw);

        // then
        assert_that!(parsed).has_value(ControlEvent::Reset);
    }

    #[test]
    fn parse_unknown() {
        assert_that!(ControlEvent::from_bytes(b"explode")).is_none();
    }
}
