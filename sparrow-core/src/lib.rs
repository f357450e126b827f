//! Sparrow protocol core: NMDC command model, line framing, lock/key handshake, share data.
//! No I/O; the daemon crate owns sockets and tasks.

pub mod escape;
pub mod lock;
pub mod protocol;
pub mod user;
pub mod wire;

pub use lock::{generate_lock, lock_to_key, KeyDerivation, LockError, NmdcKey};
pub use protocol::{Command, CommandError, PROTOCOL_VERSION};
pub use user::{Directory, File, FileList, User};
pub use wire::{decode_line, decode_raw_line, encode_line, LineDecodeError, LineEncodeError};
