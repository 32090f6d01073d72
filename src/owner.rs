//! Exclusive owner binding between mailboxes and application objects.
//!
//! An application object implementing [`MailboxOwner`] can be bound to a
//! mailbox through an [`OwnerRegistry`]. The binding is bidirectional and
//! exclusive in both directions: a mailbox has at most one owner and an
//! owner has at most one mailbox. Rebinding either side silently releases
//! the previous pairing. Both back-references are weak, so a binding never
//! keeps either side alive.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::mailbox::Mailbox;

/// An application object that can own a mailbox.
///
/// Implementors embed a [`MailboxSlot`] and return it from
/// [`mailbox_slot`](MailboxOwner::mailbox_slot); the registry stores the
/// back-reference there. The `Any` supertrait lets
/// [`Mailbox::owner_as`] recover the concrete type.
pub trait MailboxOwner: std::any::Any + Send + Sync {
    /// The slot this owner keeps its mailbox back-reference in.
    fn mailbox_slot(&self) -> &MailboxSlot;
}

/// Storage for an owner's weak back-reference to its mailbox.
#[derive(Debug, Default)]
pub struct MailboxSlot {
    mailbox: Mutex<Weak<Mailbox>>,
}

impl MailboxSlot {
    /// An empty slot, not bound to any mailbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// The currently bound mailbox, if any and still alive.
    pub fn get(&self) -> Option<Arc<Mailbox>> {
        self.mailbox.lock().upgrade()
    }

    fn set(&self, mailbox: &Arc<Mailbox>) {
        *self.mailbox.lock() = Arc::downgrade(mailbox);
    }

    fn clear(&self) {
        *self.mailbox.lock() = Weak::new();
    }
}

/// Serializes all bind and unbind operations so both directions of a
/// pairing always change together.
#[derive(Debug, Default)]
pub struct OwnerRegistry {
    lock: Mutex<()>,
}

impl OwnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `owner` and `mailbox` to each other, releasing any previous
    /// pairing either of them was part of. Rebinding an existing pair is
    /// a no-op in effect.
    pub fn bind<T: MailboxOwner>(&self, owner: &Arc<T>, mailbox: &Arc<Mailbox>) {
        let owner: Arc<dyn MailboxOwner> = owner.clone();
        let _guard = self.lock.lock();
        Self::release_owner(&owner);
        Self::release_mailbox(mailbox);
        owner.mailbox_slot().set(mailbox);
        mailbox.set_owner_weak(Some(Arc::downgrade(&owner)));
    }

    /// Release whatever pairing `owner` is part of, if any.
    pub fn unbind_owner<T: MailboxOwner>(&self, owner: &Arc<T>) {
        let owner: Arc<dyn MailboxOwner> = owner.clone();
        let _guard = self.lock.lock();
        Self::release_owner(&owner);
    }

    /// Release whatever pairing `mailbox` is part of, if any.
    pub fn unbind_mailbox(&self, mailbox: &Arc<Mailbox>) {
        let _guard = self.lock.lock();
        Self::release_mailbox(mailbox);
    }

    fn release_owner(owner: &Arc<dyn MailboxOwner>) {
        if let Some(old) = owner.mailbox_slot().get() {
            old.set_owner_weak(None);
        }
        owner.mailbox_slot().clear();
    }

    fn release_mailbox(mailbox: &Arc<Mailbox>) {
        if let Some(old) = mailbox.owner() {
            old.mailbox_slot().clear();
        }
        mailbox.set_owner_weak(None);
    }
}
