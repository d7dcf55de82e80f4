//! Walks a typed message through an onion reply route over a simulated
//! node table, printing what each relay sees.
use std::collections::HashMap;

use mixroute::{onion, Identifier};
use rand::seq::SliceRandom;

fn main() {
    let mut rng = rand::thread_rng();

    let mut nodes: HashMap<Identifier, onion::Node> = HashMap::new();
    for _ in 0..20 {
        let node = onion::Node::generate(&mut rng).unwrap();
        nodes.insert(node.id(), node);
    }
    let ids: Vec<Identifier> = nodes.keys().copied().collect();
    println!("I've generated {} relay nodes", nodes.len());

    // Bob publishes a reply route through two relays.
    let bob = &nodes[ids.choose(&mut rng).unwrap()];
    let mut builder = bob.receive_route(&mut rng).unwrap();
    for _ in 0..2 {
        let hop = ids.choose(&mut rng).unwrap();
        builder.push(&mut rng, &nodes[hop].public()).unwrap();
    }
    let (route_id, keys, mut builder) = builder.receive(&mut rng).unwrap();
    bob.register(route_id, keys);
    println!("Bob ({bob}) is reachable as route {route_id}");

    // Alice extends the published route with two hops of her own.
    for _ in 0..2 {
        let hop = ids.choose(&mut rng).unwrap();
        builder.push(&mut rng, &nodes[hop].public()).unwrap();
    }

    println!("Please enter a message:");
    let mut text = String::new();
    std::io::stdin().read_line(&mut text).unwrap();
    let mut pkg = builder.send(&mut rng, text.trim_end().as_bytes()).unwrap();

    let mut current = &nodes[&pkg.next];
    loop {
        println!("Node {} received the package", current);
        println!("    Header size: {}", pkg.map.len());
        current.route(&mut rng, &mut pkg).unwrap();
        if !current.should_continue(pkg.next) {
            break;
        }
        current = &nodes[&pkg.next];
    }

    let plain = current.open(&mut pkg).unwrap();
    println!(
        "\x1B[32mDelivered to {}: {}\x1B[0m",
        current,
        String::from_utf8_lossy(&plain)
    );
}
