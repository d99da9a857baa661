pub mod cache;
pub mod calculator;
pub mod canopy;
pub mod conditions;
pub mod drying;
pub mod gateway;
pub mod observation;
pub mod open_meteo;
pub mod pest;
pub mod registry;
pub mod scheduler;
pub mod yr;
