pub mod chart;
pub mod config;
pub mod design;
pub mod extract;
pub mod fetch;
pub mod fit;
pub mod margins;
pub mod pooling;
pub mod report;
