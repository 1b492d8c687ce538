//! Long-run behaviour of a simulated overlay.

use crate::*;

#[test]
fn views_stay_logarithmic_in_network_size() -> Result<()> {
    const N: usize = 30;
    let mut net = Network::new(40);
    net.grow(N)?;
    let ln_n = (N as f64).ln();

    for _ in 0..6 {
        let before = net.total_arcs();
        net.round()?;
        assert_eq!(net.total_arcs(), before, "a quiet round lost or created arcs");
        net.advance(Duration::from_secs(31))?;
        net.check_invariants()?;
    }

    let mean = net.mean_view();
    assert!(mean >= 1.5, "mean view {mean:.2} collapsed");
    assert!(mean <= 4.0 * ln_n, "mean view {mean:.2} exceeds 4 ln n = {:.2}", 4.0 * ln_n);
    Ok(())
}
