pub mod anomaly;
pub mod density;
pub mod detection;
pub mod heatmap;
pub mod history;
