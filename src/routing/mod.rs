mod table;

pub use table::{RouteTable, UpstreamRoute};
