//! Group records.
//!
//! Groups are a thin replicated-metadata layer over the peer mesh: any
//! participant may create one, every instance mirrors it, and a
//! destroyed group id is retired for the rest of the session so a
//! late GROUP_CREATE from a slow peer cannot resurrect it.

use crate::types::UserContext;

#[derive(Debug, Clone)]
pub struct GroupRecord {
    pub name: String,
    pub data: Vec<u8>,
    pub ctx: UserContext,
}

impl GroupRecord {
    pub fn new(name: String, data: Vec<u8>, ctx: UserContext) -> GroupRecord {
        GroupRecord { name, data, ctx }
    }
}
