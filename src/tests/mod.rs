pub mod utils;

mod algorithms;
mod rounds;
mod termination;
