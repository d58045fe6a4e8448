//! Lifecycle states shared by publishers and subscribers.

use std::fmt;

use tether_types::TetherError;

/// Registration with the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegisterState {
    #[default]
    Unregistered,
    Registering,
    Registered,
    Unregistering,
}

impl RegisterState {
    /// Move `self` from `expected` to `next`, or fail without side effects.
    pub fn transition(&mut self, expected: RegisterState, next: RegisterState) -> Result<(), TetherError> {
        if *self != expected {
            return Err(invalid_state(*self, expected));
        }
        *self = next;
        Ok(())
    }

    pub fn is_registered(self) -> bool {
        self == RegisterState::Registered
    }
}

impl fmt::Display for RegisterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegisterState::Unregistered => "unregistered",
            RegisterState::Registering => "registering",
            RegisterState::Registered => "registered",
            RegisterState::Unregistering => "unregistering",
        };
        f.write_str(name)
    }
}

fn invalid_state(actual: RegisterState, expected: RegisterState) -> TetherError {
    TetherError::Aborted(format!("invalid state: {actual}, expected {expected}"))
}

/// Whether a subscriber's receive and notify loops are running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriberState {
    Started,
    Stopping,
    #[default]
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_checks_current_state() {
        let mut state = RegisterState::default();
        state
            .transition(RegisterState::Unregistered, RegisterState::Registering)
            .unwrap();
        let err = state
            .transition(RegisterState::Unregistered, RegisterState::Registering)
            .unwrap_err();
        assert!(matches!(err, TetherError::Aborted(ref m) if m.starts_with("invalid state")));
        assert_eq!(state, RegisterState::Registering);
    }
}
