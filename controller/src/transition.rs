use kube::runtime::controller::Action;
use std::time::Duration;

/// What a transitioner wants to happen after one step of its state machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Transition {
    pub requeue: bool,
    pub requeue_after: Option<Duration>,
}

impl Transition {
    /// Run the state machine again once `duration` has passed.
    pub fn requeue_after(duration: Duration) -> Self {
        Transition {
            requeue: true,
            requeue_after: Some(duration),
        }
    }

    /// Nothing left to do until the object changes.
    pub fn done() -> Self {
        Transition {
            requeue: false,
            requeue_after: None,
        }
    }
}

impl From<Transition> for Action {
    fn from(transition: Transition) -> Self {
        if transition.requeue {
            Action::requeue(transition.requeue_after.unwrap_or(Duration::ZERO))
        } else {
            Action::await_change()
        }
    }
}
