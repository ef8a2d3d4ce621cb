pub use crate::codecs::*;
pub use crate::error::*;
pub use crate::event::*;
pub use crate::host::*;

pub use crate::backend::*;
pub use crate::encoder::*;
pub use crate::source::*;

pub use crate::output::*;

pub use crate::types::*;
