//! Handshake deadlines and stray tickets.

use crate::*;

#[test]
fn unanswered_link_times_out_with_exactly_one_repair() -> Result<()> {
    let mut net = Network::new(30);
    let a = net.add("a");
    let b = net.add("b");
    let c = net.add("c");
    net.join(&b, &a)?;
    net.silence(&b);
    net.join(&c, &a)?;

    // c reached a, but b never answers c's offer.
    assert_eq!(net.spray(&c).view().peers(), vec![a.clone()]);
    assert_eq!(net.spray(&c).pending().len(), 1);
    assert_eq!(net.spray(&a).forwards().len(), 1);

    net.advance(Duration::from_secs(29))?;
    assert_eq!(net.spray(&c).pending().len(), 1);

    net.advance(Duration::from_secs(1))?;
    assert!(net.spray(&c).pending().is_empty());
    assert!(net.spray(&b).pending().is_empty());
    assert!(net.spray(&a).forwards().is_empty());
    assert_eq!(net.spray(&c).view().occurrences(&a), 2);
    let closes = net
        .node(&c)?
        .events
        .iter()
        .filter(|e| **e == SprayEvent::Close(b.clone()))
        .count();
    assert_eq!(closes, 1);

    net.advance(Duration::from_secs(60))?;
    assert_eq!(net.view_len(&c), 2);
    net.check_invariants()
}

#[test]
fn answer_for_unknown_job_changes_nothing() -> Result<()> {
    let mut net = Network::new(31);
    let a = net.add("a");
    let b = net.add("b");
    net.join(&b, &a)?;

    let channel = net.spray(&b).sockets().get(&a).context("b has no channel to a")?;
    let stray = Message::StampedTicket {
        job_id: JobId::new(4242),
        answer: SignalPayload::new("answer/b/9"),
        sender: b.clone(),
    };
    net.node_mut(&b)?.spray.transport_mut().send(channel, &stray)?;
    net.pump()?;

    let spray = net.spray(&a);
    assert_eq!(spray.view().peers(), vec![b.clone()]);
    assert!(spray.pending().is_empty());
    assert!(spray.forwards().is_empty());
    assert_eq!(spray.sockets().len(), 1);
    Ok(())
}
