//! Pipeline lifecycle state management

/// Lifecycle state of a capture graph
///
/// States are ordered: a graph climbs `Null → Ready → Paused → Playing` one
/// step at a time and walks back down the same way on shutdown. Every step
/// is reported on the event channel as a `StateChanged` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LifecycleState {
    /// No resources allocated, stages are idle
    #[default]
    Null,

    /// Chain verified and linked, nothing running yet
    Ready,

    /// Stages started and workers spawned, sources gated
    Paused,

    /// Data is flowing
    Playing,
}

impl LifecycleState {
    /// All states in ascending order
    pub const ALL: [LifecycleState; 4] = [
        LifecycleState::Null,
        LifecycleState::Ready,
        LifecycleState::Paused,
        LifecycleState::Playing,
    ];

    /// The adjacent state one step closer to `target`, or `None` if already there
    pub fn next_towards(self, target: LifecycleState) -> Option<LifecycleState> {
        use LifecycleState::*;

        if self == target {
            return None;
        }

        let next = if target > self {
            match self {
                Null => Ready,
                Ready => Paused,
                Paused | Playing => Playing,
            }
        } else {
            match self {
                Playing => Paused,
                Paused => Ready,
                Ready | Null => Null,
            }
        };
        Some(next)
    }

    /// The full list of single steps needed to reach `target`
    pub fn path_to(self, target: LifecycleState) -> Vec<(LifecycleState, LifecycleState)> {
        let mut steps = Vec::new();
        let mut current = self;
        while let Some(next) = current.next_towards(target) {
            steps.push((current, next));
            current = next;
        }
        steps
    }

    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            LifecycleState::Null => "Null",
            LifecycleState::Ready => "Ready",
            LifecycleState::Paused => "Paused",
            LifecycleState::Playing => "Playing",
        }
    }

    /// Check if stage workers exist (paused or playing)
    pub fn is_active(&self) -> bool {
        matches!(self, LifecycleState::Paused | LifecycleState::Playing)
    }

    /// Check if data is flowing
    pub fn is_playing(&self) -> bool {
        matches!(self, LifecycleState::Playing)
    }

    pub(crate) fn as_u8(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_u8(value: u8) -> LifecycleState {
        match value {
            1 => LifecycleState::Ready,
            2 => LifecycleState::Paused,
            3 => LifecycleState::Playing,
            _ => LifecycleState::Null,
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleState::*;

    #[test]
    fn test_upward_path() {
        assert_eq!(
            Null.path_to(Playing),
            vec![(Null, Ready), (Ready, Paused), (Paused, Playing)]
        );
        assert_eq!(Ready.path_to(Paused), vec![(Ready, Paused)]);
    }

    #[test]
    fn test_downward_path() {
        assert_eq!(
            Playing.path_to(Null),
            vec![(Playing, Paused), (Paused, Ready), (Ready, Null)]
        );
        assert_eq!(Paused.path_to(Ready), vec![(Paused, Ready)]);
    }

    #[test]
    fn test_self_transition_is_empty() {
        for state in LifecycleState::ALL {
            assert!(state.path_to(state).is_empty());
            assert_eq!(state.next_towards(state), None);
        }
    }

    #[test]
    fn test_state_checks() {
        assert!(Playing.is_active());
        assert!(Playing.is_playing());
        assert!(Paused.is_active());
        assert!(!Paused.is_playing());
        assert!(!Ready.is_active());
        assert!(!Null.is_active());
    }

    #[test]
    fn test_u8_round_trip() {
        for state in LifecycleState::ALL {
            assert_eq!(LifecycleState::from_u8(state.as_u8()), state);
        }
    }
}
