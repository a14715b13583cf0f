#[cfg(not(target_pointer_width = "64"))]
compile_error!(
    "library is only guaranteed to run on 64 bit machines due to casts from/to u64 and usize"
);

pub mod block;
pub mod instance;
pub mod mailbox;
pub mod primitive;
pub mod protocol;
pub mod request;
