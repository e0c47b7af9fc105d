mod file_assignment_store;
mod http_client;
mod logging_event_listener;
mod tcp_client;
mod tcp_health_probe;
mod udp_client;
mod ws_client;

pub use file_assignment_store::FileAssignmentStore;
pub use http_client::{HttpClient, HttpClientFactory};
pub use logging_event_listener::LoggingEventListener;
pub use tcp_client::{TcpClient, TcpClientFactory};
pub use tcp_health_probe::TcpHealthProbe;
pub use udp_client::{UdpClient, UdpClientFactory};
pub use ws_client::{WsClient, WsClientFactory, WsOperation, DEFAULT_DELAY_TIME_MS};
