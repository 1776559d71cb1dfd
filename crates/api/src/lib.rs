//! Herald HTTP API: insight ingress, interaction callbacks and operator
//! queries over the delivery pipeline.

pub mod routes;
pub mod state;
