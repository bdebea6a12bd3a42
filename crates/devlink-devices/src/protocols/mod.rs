/*!
 * Protocol implementations for devlink.
 *
 * Two small wire formats, one per read strategy: a newline-terminated
 * ASCII protocol and a fixed-length binary register protocol.
 */

pub mod line;
pub mod register;

pub use line::{Line, LineCommand, LineEncoder};
pub use register::{RegisterAccess, RegisterEncoder, RegisterFrame, RegisterOp};
