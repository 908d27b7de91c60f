use simulation::{simulate_collective_dormancy, simulate_partition_heal, simulate_scaling};
use tracing_subscriber::EnvFilter;
pub mod simulation;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn std::error::Error>> {

    // Run partition simulations
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            PARTITION SIMULATIONS                           ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    // Simulation 1: small cluster, one node cut off
    let stats = simulate_partition_heal(4, 1, 50, 1).await?;
    stats.print();

    // Simulation 2: even split
    let stats = simulate_partition_heal(6, 3, 200, 2).await?;
    stats.print();

    // Simulation 3: collective goes dormant and comes back
    let stats = simulate_collective_dormancy(5).await?;
    stats.print();

    // Simulation 4: scaling analysis
    simulate_scaling(12, 3).await?;

    println!("\n✓ All simulations completed successfully!");
    Ok(())
}
