mod definitions;
pub use definitions::*;

mod misc;
pub use misc::*;

mod resource_state;
pub use resource_state::*;
