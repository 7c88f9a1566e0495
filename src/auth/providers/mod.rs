// Upstream credential providers

pub mod copilot;
