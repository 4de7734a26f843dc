use std::sync::Arc;

use courier_core::{Channel, MessageId, MessageStatus, PartyId};
use courier_engine::ExchangeDriver;
use courier_sim::scenarios::SAMPLE_CATALOGUE;
use courier_sim::SimCluster;
use courier_transport::adapter::{route_in_memory_outbound, InMemoryTransport};
use courier_transport::envelope::EnvelopeKind;

fn status(cluster: &SimCluster, id: &str) -> MessageStatus {
    let node = cluster.node("observer").expect("observer");
    node.store()
        .message(&MessageId::new(id).expect("id"))
        .expect("read")
        .expect("record")
        .status
}

#[test]
fn receipt_can_land_on_a_different_cluster_node() {
    let cluster = SimCluster::new(SAMPLE_CATALOGUE, 5_000).expect("cluster");
    let mut serving = ExchangeDriver::new(
        Arc::new(cluster.node("node-a1").expect("a1")),
        InMemoryTransport::new(),
    );
    let mut receiving = ExchangeDriver::new(
        Arc::new(cluster.node("node-a2").expect("a2")),
        InMemoryTransport::new(),
    );
    let mut initiator = ExchangeDriver::new(
        Arc::new(cluster.standalone_node("node-b").expect("b")),
        InMemoryTransport::new(),
    );

    cluster
        .submit(serving.coordinator(), "inv-1", "invoice-pull")
        .expect("submit");
    cluster
        .submit(serving.coordinator(), "inv-2", "invoice-pull")
        .expect("submit");

    let targets = [(
        PartyId::new("party-a").expect("party"),
        Channel::new("mpc/invoices").expect("channel"),
    )];
    assert_eq!(initiator.initiate_pulls(&targets), 1);
    route_in_memory_outbound(initiator.transport_mut(), serving.transport_mut(), "party-b");
    serving.pump_inbound();

    let answers = serving.transport_mut().take_outbound();
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].1.kind, EnvelopeKind::UserMessage);
    assert_eq!(answers[0].1.message_id.as_ref().map(MessageId::as_str), Some("inv-1"));
    for (_, envelope) in answers {
        initiator.transport_mut().enqueue_inbound("party-a", envelope);
    }
    initiator.pump_inbound();

    // The receipt is routed to another node of the responder cluster.
    route_in_memory_outbound(initiator.transport_mut(), receiving.transport_mut(), "party-b");
    receiving.pump_inbound();

    assert_eq!(status(&cluster, "inv-1"), MessageStatus::Acknowledged);
    assert_eq!(status(&cluster, "inv-2"), MessageStatus::ReadyToPull);
    assert_eq!(cluster.sink().acknowledged().len(), 1);
}

#[test]
fn push_message_is_dispatched_once_by_one_node() {
    let cluster = SimCluster::new(SAMPLE_CATALOGUE, 5_000).expect("cluster");
    let submitter = cluster.node("node-a1").expect("a1");
    cluster
        .submit(&submitter, "ord-1", "order-push")
        .expect("submit");

    let mut first = ExchangeDriver::new(Arc::new(submitter), InMemoryTransport::new());
    let mut second = ExchangeDriver::new(
        Arc::new(cluster.node("node-a2").expect("a2")),
        InMemoryTransport::new(),
    );
    assert_eq!(first.dispatch_due().expect("dispatch"), 1);
    assert_eq!(second.dispatch_due().expect("dispatch"), 0);
    assert_eq!(status(&cluster, "ord-1"), MessageStatus::WaitingForReceipt);

    let mut receiver = ExchangeDriver::new(
        Arc::new(cluster.standalone_node("node-b").expect("b")),
        InMemoryTransport::new(),
    );
    route_in_memory_outbound(first.transport_mut(), receiver.transport_mut(), "party-a");
    receiver.pump_inbound();
    route_in_memory_outbound(receiver.transport_mut(), second.transport_mut(), "party-b");
    second.pump_inbound();

    assert_eq!(status(&cluster, "ord-1"), MessageStatus::Acknowledged);
}
