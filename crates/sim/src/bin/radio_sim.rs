//! radio simulation for the WPAN transceiver

use anyhow::Result;
use colored::Colorize;
use wpan_sim::{scenarios, SimulationPresets};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    println!("{}", "WPAN Transceiver Simulation".bright_blue().bold());
    println!("{}", "===========================".bright_blue());

    let sweep = scenarios::phy_snr_sweep(&[0.0, 2.0, 4.0, 6.0, 10.0, 20.0], 50).await?;
    if let Some(floor) = sweep.iter().find(|p| p.frame_success_rate() >= 0.9) {
        println!(
            "{}",
            format!("90% frame success from {:.1} dB SNR", floor.snr_db).bright_yellow()
        );
    }

    let test_scenarios = vec![
        ("Good Conditions", SimulationPresets::good_conditions()),
        ("Average Conditions", SimulationPresets::average_conditions()),
        ("Poor Conditions", SimulationPresets::poor_conditions()),
    ];

    for (name, config) in test_scenarios {
        println!("{}", format!("\n>>> Testing: {}", name).bright_green().bold());
        println!("SNR: {} dB", config.snr_db);
        println!("Packet Loss: {}%", (config.packet_loss * 100.0) as u32);
        println!("Latency: {:?}", config.latency);

        scenarios::two_node_exchange(config.clone(), 20).await?;
        scenarios::broadcast_flood(config, 4, 5).await?;

        println!("{}", "Test complete!".bright_yellow());
        println!("{}", "-".repeat(50));
    }

    println!("{}", "\n>>> Testing: Extreme Conditions".bright_red().bold());
    let extreme = SimulationPresets::extreme_conditions();
    println!("SNR: {} dB", extreme.snr_db);
    println!("Packet Loss: {}%", (extreme.packet_loss * 100.0) as u32);
    println!("Latency: {:?}", extreme.latency);

    let report = scenarios::two_node_exchange(extreme, 20).await?;
    if report.failed > 0 {
        println!(
            "{}",
            format!("{} of {} messages exhausted their retries", report.failed, report.sent).bright_red()
        );
    }

    println!("\n{}", "All simulations complete!".bright_green().bold());
    Ok(())
}
