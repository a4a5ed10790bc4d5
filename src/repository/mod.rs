pub mod memory;
pub mod proxy;
pub mod store;

pub use memory::MemoryStore;
pub use proxy::ProxyRepository;
pub use store::ProxyStore;
