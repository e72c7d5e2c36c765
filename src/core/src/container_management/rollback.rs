use crate::container_management::types::Compensation;

/// Stack of compensations recorded as provisioning steps succeed.
///
/// Unwinding pops in reverse, so the last thing built is the first thing
/// torn down. Dropping a `Rollback` does nothing: a committed instance simply
/// lets it go out of scope.
#[derive(Debug, Default)]
pub struct Rollback {
    actions: Vec<Compensation>,
}

impl Rollback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, action: Compensation) {
        self.actions.push(action);
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Compensations in the order they must run.
    pub fn drain_reversed(&mut self) -> impl Iterator<Item = Compensation> + '_ {
        self.actions.drain(..).rev()
    }
}
