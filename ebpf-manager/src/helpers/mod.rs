pub(crate) mod wait_group;
pub(crate) use wait_group::*;
