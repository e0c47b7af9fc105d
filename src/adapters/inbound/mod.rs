mod admin_api;
mod error;
mod http_relay;
mod http_server;
mod tcp_relay;
mod udp_relay;
mod ws_relay;

pub use admin_api::{admin_router, AdminServer, AdminState, HostEntry};
pub use error::RelayError;
pub use http_relay::{
    encode_uri, metric_from_expression, relayed_headers, ClientIdentity, HttpRelayHandler, RelayRequest,
    RelayResponse, PROXIED_ENTITIES_HEADER, PROXIED_ISSUERS_HEADER,
};
pub use http_server::{relay_router, HttpRelayServer, ISSUER_DN_HEADER, SUBJECT_DN_HEADER};
pub use tcp_relay::{put_metric, TcpRelay, ERR_MSG};
pub use udp_relay::{UdpRelay, UdpRelayConfig};
pub use ws_relay::{error_frame, WsRelayHandler, WsRelayServer, WsSession};
