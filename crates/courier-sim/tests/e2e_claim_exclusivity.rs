use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::thread;

use courier_core::{Channel, MessageId, MessageStatus, PModeKey};
use courier_engine::{PullResponse, Submission};
use courier_sim::scenarios::{practical_contention, SAMPLE_CATALOGUE};
use courier_sim::SimCluster;
use rand::{rngs::StdRng, Rng, SeedableRng};

#[test]
fn concurrent_nodes_never_claim_the_same_message() {
    let scenario = practical_contention();
    let cluster = SimCluster::new(SAMPLE_CATALOGUE, 1_000_000).expect("cluster");
    let submitter = cluster.node("node-0").expect("submitter");

    let channels: Vec<Channel> = (0..scenario.sub_channels)
        .map(|i| Channel::new(format!("mpc/invoices/sub-{i}")).expect("channel"))
        .collect();
    let mut rng = StdRng::seed_from_u64(0xC1A1_7E57);
    let mut expected: HashMap<Channel, HashSet<MessageId>> = HashMap::new();
    for n in 0..scenario.messages {
        let channel = channels[rng.gen_range(0..channels.len())].clone();
        let message_id = MessageId::new(format!("m-{n}")).expect("id");
        submitter
            .submit(Submission {
                message_id: message_id.clone(),
                pmode_key: PModeKey::new("invoice-pull").expect("key"),
                channel: Some(channel.clone()),
            })
            .expect("submit");
        expected.entry(channel).or_default().insert(message_id);
    }

    let nodes: Vec<_> = (1..=scenario.nodes)
        .map(|i| cluster.node(&format!("node-{i}")).expect("node"))
        .collect();
    let claimed: Mutex<Vec<(Channel, MessageId)>> = Mutex::new(Vec::new());

    thread::scope(|scope| {
        for node in &nodes {
            let channels = &channels;
            let claimed = &claimed;
            scope.spawn(move || {
                let mut idle = 0;
                let mut next = 0;
                while idle < channels.len() {
                    let channel = &channels[next % channels.len()];
                    next += 1;
                    match node
                        .handle_inbound_pull_request(channel, None)
                        .expect("pull request")
                    {
                        PullResponse::Message(id) => {
                            idle = 0;
                            claimed.lock().expect("lock").push((channel.clone(), id));
                        }
                        PullResponse::Empty => idle += 1,
                    }
                }
            });
        }
    });

    let claimed = claimed.into_inner().expect("lock");
    assert_eq!(claimed.len(), scenario.messages, "every message claimed once");

    let mut seen = HashSet::new();
    for (channel, id) in &claimed {
        assert!(seen.insert(id.clone()), "{id} claimed twice");
        assert!(
            expected[channel].contains(id),
            "{id} served on the wrong channel {channel}"
        );
    }

    for id in seen {
        let record = submitter.store().message(&id).expect("read").expect("record");
        assert_eq!(record.status, MessageStatus::WaitingForReceipt);
        let claim = submitter.store().claim_of(&id).expect("read").expect("claim");
        assert!(claim.claimed_by.is_some());
    }
}

#[test]
fn claims_follow_submission_order_across_nodes() {
    let cluster = SimCluster::new(SAMPLE_CATALOGUE, 1_000_000).expect("cluster");
    let a = cluster.node("node-a").expect("node a");
    let b = cluster.node("node-b").expect("node b");
    let channel = Channel::new("mpc/invoices").expect("channel");

    for n in 0..4 {
        cluster
            .submit(if n % 2 == 0 { &a } else { &b }, &format!("m-{n}"), "invoice-pull")
            .expect("submit");
        cluster.clock().advance(std::time::Duration::from_millis(1));
    }

    let order: Vec<_> = (0..4)
        .map(|n| {
            let node = if n % 2 == 0 { &b } else { &a };
            match node.handle_inbound_pull_request(&channel, None).expect("pull") {
                PullResponse::Message(id) => id.as_str().to_string(),
                PullResponse::Empty => panic!("queue drained early"),
            }
        })
        .collect();
    assert_eq!(order, ["m-0", "m-1", "m-2", "m-3"]);
}
