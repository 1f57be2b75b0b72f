// SPDX-FileCopyrightText: The umpio authors
// SPDX-License-Identifier: MPL-2.0

use std::{io::stdin, sync::Arc};

use umpio::{make_endpoints, Config, NativeApis, NoListener, PacketProtocol, View};

fn main() {
    pretty_env_logger::init();

    match run() {
        Ok(()) => (),
        Err(err) => eprintln!("Error: {err}"),
    }
}

fn run() -> anyhow::Result<()> {
    let apis = NativeApis::default();
    let config = Config::default().with_client_name("list-endpoints");
    let listener = Arc::new(|| println!("Endpoints changed"));
    let Some(endpoints) = make_endpoints(&apis, &config, listener) else {
        anyhow::bail!("No MIDI backend available");
    };
    println!("Using {backend} backend", backend = endpoints.backend());

    let ids = endpoints.endpoints();
    if ids.is_empty() {
        println!("No endpoints found");
        return Ok(());
    }
    for (i, id) in ids.iter().enumerate() {
        let name = endpoints
            .endpoint(id)
            .map(|endpoint| endpoint.name().to_owned())
            .unwrap_or_default();
        println!("{number}: {name} ({id})", number = i + 1);
    }

    // Monitor the endpoint with the number given on the command line
    let Some(number) = std::env::args().nth(1) else {
        return Ok(());
    };
    let number = number.parse::<usize>()?;
    let Some(id) = number.checked_sub(1).and_then(|index| ids.get(index)) else {
        anyhow::bail!("Unknown endpoint number {number}");
    };
    let Some(session) = endpoints.make_session("list-endpoints") else {
        anyhow::bail!("Failed to create session");
    };
    let consumer = Arc::new(|packet: View<'_>, timestamp: f64| {
        println!("{timestamp:.3}: {packet:?}");
    });
    let Some(input) = session.connect_input(
        Arc::new(NoListener),
        id,
        PacketProtocol::Midi2,
        consumer,
    ) else {
        anyhow::bail!("Failed to connect {id}");
    };
    println!("Monitoring {id}, press Enter to quit");
    stdin().read_line(&mut String::new())?;
    drop(input);
    Ok(())
}
