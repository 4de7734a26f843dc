use std::sync::Barrier;
use std::thread;
use std::time::Duration;

use courier_core::{Channel, MessageId, MessageStatus};
use courier_engine::{EngineError, PullResponse, ReceivedResponse, ReliabilityOutcome};
use courier_sim::scenarios::SAMPLE_CATALOGUE;
use courier_sim::SimCluster;

const ROUNDS: usize = 24;

#[test]
fn late_receipt_and_expiry_never_both_apply() {
    let cluster = SimCluster::new(SAMPLE_CATALOGUE, 10_000_000).expect("cluster");
    let receiver = cluster.node("node-receipt").expect("receipt node");
    let sweeper = cluster.node("node-sweeper").expect("sweeper node");
    let channel = Channel::new("mpc/invoices").expect("channel");

    for round in 0..ROUNDS {
        let id = format!("m-{round}");
        cluster.submit(&receiver, &id, "invoice-pull").expect("submit");
        let message_id = MessageId::new(id.as_str()).expect("id");
        assert_eq!(
            sweeper
                .handle_inbound_pull_request(&channel, None)
                .expect("pull"),
            PullResponse::Message(message_id.clone())
        );
        // Claim is stale, but the receipt is already in flight.
        cluster.clock().advance(Duration::from_secs(61));

        let barrier = Barrier::new(2);
        let (receipt, expired) = thread::scope(|scope| {
            let receipt = scope.spawn(|| {
                barrier.wait();
                receiver.handle_inbound_receipt(
                    &message_id,
                    Some(&ReceivedResponse::receipt(message_id.clone())),
                )
            });
            let expired = scope.spawn(|| {
                barrier.wait();
                sweeper.expire_stale_claims()
            });
            (
                receipt.join().expect("receipt thread"),
                expired.join().expect("sweeper thread").expect("sweep"),
            )
        });

        let record = receiver
            .store()
            .message(&message_id)
            .expect("read")
            .expect("record");
        match receipt {
            Ok(outcome) => {
                assert_eq!(outcome, ReliabilityOutcome::Ok);
                assert_eq!(expired, 0, "round {round}: expiry applied after receipt");
                assert_eq!(record.status, MessageStatus::Acknowledged);
                assert_eq!(record.send_attempts, 0);
            }
            Err(EngineError::ClaimExpired(_)) => {
                assert_eq!(expired, 1, "round {round}: receipt refused without expiry");
                assert_eq!(record.status, MessageStatus::WaitingForRetry);
                assert_eq!(record.send_attempts, 1);
            }
            Err(other) => panic!("round {round}: unexpected error {other}"),
        }

        // Park retried messages so the next round claims its own message.
        if record.status == MessageStatus::WaitingForRetry {
            receiver.delete(&message_id).expect("delete");
        }
    }

    let acked = cluster.sink().acknowledged().len();
    assert!(acked <= ROUNDS);
    assert!(cluster.sink().terminal_failures().is_empty());
}

#[test]
fn receipt_after_expiry_is_rejected_on_any_node() {
    let cluster = SimCluster::new(SAMPLE_CATALOGUE, 10_000_000).expect("cluster");
    let a = cluster.node("node-a").expect("node a");
    let b = cluster.node("node-b").expect("node b");
    let channel = Channel::new("mpc/invoices").expect("channel");

    cluster.submit(&a, "m-1", "invoice-pull").expect("submit");
    a.handle_inbound_pull_request(&channel, None).expect("pull");
    cluster.clock().advance(Duration::from_secs(61));
    assert_eq!(a.expire_stale_claims().expect("sweep"), 1);

    let message_id = MessageId::new("m-1").expect("id");
    let err = b
        .handle_inbound_receipt(&message_id, Some(&ReceivedResponse::receipt(message_id.clone())))
        .expect_err("late receipt");
    assert!(matches!(err, EngineError::ClaimExpired(_)));
}
