//! Periodic shuffles between live peers.

use crate::*;

#[test]
fn two_peer_exchange_keeps_both_views() -> Result<()> {
    let mut net = Network::new(10);
    let a = net.add("a");
    let b = net.add("b");
    net.join(&b, &a)?;

    for _ in 0..5 {
        assert!(net.exchange(&b)?.is_some());
        assert_eq!(net.spray(&a).view().peers(), vec![b.clone()]);
        assert_eq!(net.spray(&b).view().peers(), vec![a.clone()]);
        assert!(net.exchange(&a)?.is_some());
        assert_eq!(net.view_len(&a), 1);
        assert_eq!(net.view_len(&b), 1);
    }
    net.check_invariants()
}

#[test]
fn quiet_round_conserves_total_arc_count() -> Result<()> {
    let mut net = Network::new(11);
    net.grow(12)?;
    for _ in 0..4 {
        let before = net.total_arcs();
        net.round()?;
        assert_eq!(net.total_arcs(), before);
        net.check_invariants()?;
    }
    Ok(())
}

#[test]
fn exchange_completes_without_leftover_state() -> Result<()> {
    let mut net = Network::new(12);
    let ids = net.grow(8)?;
    net.round()?;
    for id in &ids {
        assert!(net.spray(id).pending().is_empty(), "{id} has stuck handshakes");
    }
    // Forward entries of short-circuited requests linger until their deadline.
    net.advance(Duration::from_secs(30))?;
    for id in &ids {
        assert!(net.spray(id).forwards().is_empty(), "{id} still relays");
    }
    net.check_invariants()
}

#[test]
fn released_channels_are_closed_once_unreferenced() -> Result<()> {
    let mut net = Network::new(13);
    let ids = net.grow(10)?;
    net.round()?;
    net.advance(Duration::from_secs(30))?;
    net.check_invariants()?;

    for id in &ids {
        for (other, _) in net.spray(id).sockets().iter() {
            let referenced = net.spray(id).view().contains(other)
                || net.spray(other).view().contains(id);
            assert!(referenced, "channel {id} <-> {other} carries no arc");
        }
    }
    Ok(())
}
