mod common;

mod certificates;
mod send;
