//! Ensures the bots work as required, end to end, against the simulated fleet of mailservers.\
//! As a convention, each module (and their sub-test-functions) should bring a comment detailing the
//! requirement.

#[path = "../utils/mod.rs"]
mod utils;

mod retrieval;
mod cross_check;
