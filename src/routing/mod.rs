pub mod matcher;

pub use matcher::RouteTable;
