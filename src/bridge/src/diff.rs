use std::collections::BTreeSet;

use crate::index::{Registration, RegistrationIndex};
use crate::instance::ExternalInstance;

/// Actions bringing the catalog in line with a registry snapshot.
#[derive(Debug, Clone)]
pub struct Diff<I: ExternalInstance> {
    /// Registrations whose instance left the registry
    pub to_remove: Vec<Registration<I::Key>>,
    /// Instances not registered yet
    pub to_add: Vec<I>,
}

impl<I: ExternalInstance> Diff<I> {
    pub fn is_empty(&self) -> bool {
        self.to_remove.is_empty() && self.to_add.is_empty()
    }
}

/// Compare the current registrations against a fresh snapshot.
///
/// Instances whose identity is registered already are left alone, even if
/// their payload changed. Removals come out in key order, additions in
/// snapshot order; a repeated identity in the snapshot is added once.
pub fn diff<I: ExternalInstance>(current: &RegistrationIndex<I::Key>, snapshot: &[I]) -> Diff<I> {
    let remote: BTreeSet<I::Key> = snapshot.iter().map(ExternalInstance::key).collect();

    let to_remove = current
        .iter()
        .filter(|registration| !remote.contains(&registration.key))
        .cloned()
        .collect();

    let mut seen = BTreeSet::new();
    let to_add = snapshot
        .iter()
        .filter(|instance| {
            let key = instance.key();
            !current.contains(&key) && seen.insert(key)
        })
        .cloned()
        .collect();

    Diff { to_remove, to_add }
}
