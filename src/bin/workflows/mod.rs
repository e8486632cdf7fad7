mod emulate;
mod flash;

pub(crate) use emulate::{run_emulate, EmulateArgs};
pub(crate) use flash::{run_flash, FlashArgs};
