use a1_mediator::config::Config;
use a1_mediator::ei::EiBridge;
use a1_mediator::store::{RedisStore, Store};

/// Probe the configured collaborators and print a checklist.
///
/// A FAIL row does not change the exit code, so the command is safe to
/// run from init containers while dependencies are still coming up.
pub async fn run() -> anyhow::Result<()> {
    let config = Config::from_env();

    println!("Running mediator connectivity checks...\n");

    print!("  State store ................. ");
    if config.use_fake_sdl {
        println!("OK (in-memory, USE_FAKE_SDL)");
    } else {
        match RedisStore::new(&config.sdl_url) {
            Ok(store) => {
                if store.healthy().await {
                    println!("OK ({})", config.sdl_url);
                } else {
                    println!("FAIL (no PING reply from {})", config.sdl_url);
                }
            }
            Err(e) => println!("FAIL ({e})"),
        }
    }

    print!("  EI coordinator .............. ");
    match EiBridge::new(&config.ecs_service_host).probe().await {
        Ok(code) => println!("OK (HTTP {code})"),
        Err(e) => println!("FAIL ({e})"),
    }

    println!("\nAll checks completed.");
    Ok(())
}
