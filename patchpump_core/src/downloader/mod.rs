pub mod cookie_jar;
pub mod http_transport;
pub mod transport;

pub use cookie_jar::CookieJar;
pub use http_transport::HttpTransport;
pub use transport::{http_transport_factory, DownloadTransport, TransportFactory};
