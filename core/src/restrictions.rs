//! Per-connection access restrictions.
//!
//! A [`Restrictions`] set holds the address prefixes a connection boundary may
//! forward inbound traffic to. The set is kept minimal: no stored entry is a
//! prefix of another.

use crate::address::Address;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Restrictions {
    allowed: Vec<Address>,
}

impl Restrictions {
    pub fn new<I>(addresses: I) -> Self
    where
        I: IntoIterator<Item = Address>,
    {
        let mut restrictions = Self::default();
        for address in addresses {
            restrictions.add(address);
        }
        restrictions
    }

    /// Allows `address` and everything below it.
    ///
    /// No-op when already covered; otherwise entries below `address` are absorbed.
    pub fn add(&mut self, address: Address) {
        if self.allowed.iter().any(|a| a.is_parent_of(&address)) {
            return;
        }
        self.allowed.retain(|a| !address.is_parent_of(a));
        self.allowed.push(address);
    }

    /// Removes every entry equal to or below `address`.
    pub fn remove(&mut self, address: &Address) {
        self.allowed.retain(|a| !address.is_parent_of(a));
    }

    pub fn check(&self, address: &Address) -> bool {
        self.allowed.iter().any(|a| a.is_parent_of(address))
    }

    pub fn clear(&mut self) {
        self.allowed.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Address> {
        self.allowed.iter()
    }

    pub fn len(&self) -> usize {
        self.allowed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }
}

impl FromIterator<Address> for Restrictions {
    fn from_iter<T: IntoIterator<Item = Address>>(iter: T) -> Self {
        Self::new(iter)
    }
}
