/// Shape of a claim contention run.
#[derive(Debug, Clone, Copy)]
pub struct ContentionScenario {
    pub nodes: usize,
    pub messages: usize,
    pub sub_channels: usize,
}

pub const PRACTICAL_CONTENTION: ContentionScenario = ContentionScenario {
    nodes: 6,
    messages: 120,
    sub_channels: 3,
};

pub fn practical_contention() -> ContentionScenario {
    PRACTICAL_CONTENTION
}

/// Processing modes used by the scenario tests.
///
/// `invoice-pull` spreads 3 attempts over 10 minutes; `order-push` backs off
/// exponentially within an hour.
pub const SAMPLE_CATALOGUE: &str = r#"
[[process]]
key = "invoice-pull"
initiator = "party-b"
responder = "party-a"
channel = "mpc/invoices"

[process.leg]
name = "invoice"
direction = "pull"
retry = { timeout = "10m", max_attempts = 3 }

[[process]]
key = "order-push"
initiator = "party-a"
responder = "party-b"
channel = "mpc/orders"

[process.leg]
name = "order"
direction = "push"
reliability = { pattern = "response" }
retry = { timeout = "1h", max_attempts = 4, strategy = "exponential" }
"#;
