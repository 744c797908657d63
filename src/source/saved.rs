use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::models::ThreadDescriptor;

/// Posts the local user has made, used to mark saved replies in fetched
/// threads.
#[derive(Debug, Default)]
pub struct SavedReplies {
    posts: Mutex<HashSet<(ThreadDescriptor, u64)>>,
}

impl SavedReplies {
    pub fn add(&self, thread: &ThreadDescriptor, post_no: u64) {
        self.lock().insert((thread.clone(), post_no));
    }

    pub fn remove(&self, thread: &ThreadDescriptor, post_no: u64) -> bool {
        self.lock().remove(&(thread.clone(), post_no))
    }

    #[must_use]
    pub fn contains(&self, thread: &ThreadDescriptor, post_no: u64) -> bool {
        self.lock().contains(&(thread.clone(), post_no))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<(ThreadDescriptor, u64)>> {
        self.posts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
