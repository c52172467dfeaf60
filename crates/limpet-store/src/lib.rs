pub mod control;
pub mod ctrlfile;
pub mod piece;

pub use control::{ControlError, ControlState, Result, CONTROL_VERSION};
pub use ctrlfile::control_file_path;
pub use piece::{Piece, PieceTable};
