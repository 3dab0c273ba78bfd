mod common;

mod bridge;
mod pipeline;
