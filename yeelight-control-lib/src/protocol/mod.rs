//! Wire protocol of the device control socket.

pub mod codec;
pub mod command;
pub mod flow;
pub mod method;
pub mod props;
pub mod reply;

pub use codec::YeelightCodec;
pub use command::{Command, Scene};
pub use flow::{EndAction, Flow};
pub use method::{Effect, Method, MethodSet};
pub use props::{ColorMode, Prop, PropMap, PropValue};
pub use reply::Reply;
