mod executor;
mod support;
