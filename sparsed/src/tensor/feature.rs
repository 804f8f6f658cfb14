//! Feature id conventions.
//!
//! A feature id is a plain `u64`. Two packing conventions coexist for
//! grouped embedding lookups: group-16 keeps the group id in the high
//! 16 bits, group-18 in the high 18 bits. The group id selects the
//! embedding table; sharding always hashes the full id and never looks
//! at the group.

pub mod group16 {
    const KEY_BITS: u32 = 48;
    const KEY_MASK: u64 = (1 << KEY_BITS) - 1;

    pub fn make(group: u16, key: u64) -> u64 {
        debug_assert!(key <= KEY_MASK);
        ((group as u64) << KEY_BITS) | (key & KEY_MASK)
    }

    pub fn group_id(id: u64) -> u16 {
        (id >> KEY_BITS) as u16
    }

    pub fn sub_key(id: u64) -> u64 {
        id & KEY_MASK
    }
}

pub mod group18 {
    const KEY_BITS: u32 = 46;
    const KEY_MASK: u64 = (1 << KEY_BITS) - 1;
    const GROUP_MASK: u64 = (1 << 18) - 1;

    pub fn make(group: u32, key: u64) -> u64 {
        debug_assert!((group as u64) <= GROUP_MASK);
        debug_assert!(key <= KEY_MASK);
        (((group as u64) & GROUP_MASK) << KEY_BITS) | (key & KEY_MASK)
    }

    pub fn group_id(id: u64) -> u32 {
        ((id >> KEY_BITS) & GROUP_MASK) as u32
    }

    pub fn sub_key(id: u64) -> u64 {
        id & KEY_MASK
    }
}
