pub mod codec;
pub mod message;
pub mod ring;
pub mod tensor;
pub mod transport;

pub use message::{AllReducePhase, TensorMessage};
pub use ring::WorkerRing;
pub use tensor::{global_norm, ParamMap, Tensor};
pub use transport::{ChannelRing, RingTransport, TcpRing, TcpRingConfig};
