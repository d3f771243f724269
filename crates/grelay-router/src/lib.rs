mod proxy;

pub use proxy::{ProxyError, ProxyState, proxy_router};
