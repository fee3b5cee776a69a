pub mod buffer;
pub mod config;
pub mod health;
pub mod packet;
pub mod queue;
pub mod reader;
pub mod test_util;
pub mod tun;

pub use buffer::{BufferPool, PoolBuffer, PoolError};
pub use config::{ConfigError, ReaderConfig};
pub use health::{HealthCounters, HealthMetrics, HealthSnapshot};
pub use packet::{IpVersion, Packet, PacketError, PacketInfo, Protocol};
pub use queue::{PacketSink, ProtocolQueue, QueueReceivers, VpnQueues, device_to_network_queues};
pub use reader::{
    DropReason, FrameError, ReaderError, ReaderHandle, ReaderState, SkipReason, Step,
    TunPacketReader,
};
pub use tun::TunDevice;
