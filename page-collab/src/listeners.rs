//! Small callback registry shared by the replica, presence table and state
//! machine.

use std::sync::Arc;

/// Handle returned when registering a listener; pass it back to remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

pub(crate) struct Listeners<E: ?Sized> {
    next_id: u64,
    entries: Vec<(ListenerId, Callback<E>)>,
}

impl<E: ?Sized> Listeners<E> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 1,
            entries: Vec::new(),
        }
    }

    pub(crate) fn add<F>(&mut self, callback: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, Arc::new(callback)));
        id
    }

    pub(crate) fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(lid, _)| *lid != id);
        self.entries.len() != before
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Clone the callbacks out so they can run after the owner's lock is
    /// released.
    pub(crate) fn snapshot(&self) -> Vec<Callback<E>> {
        self.entries.iter().map(|(_, cb)| cb.clone()).collect()
    }
}

/// Invoke every callback in a snapshot.
pub(crate) fn emit<E: ?Sized>(callbacks: &[Callback<E>], event: &E) {
    for callback in callbacks {
        callback(event);
    }
}
