//! xBridge Wallet - Operator CLI
//!
//! Usage:
//!   xbridge-wallet address
//!   xbridge-wallet status
//!   xbridge-wallet fees
//!   xbridge-wallet send <addr> <sats> [--memo <text|0xhex>] [--tier <t>] [--wait]
//!   xbridge-wallet sign-psbt <psbt>
//!   xbridge-wallet rebuild-psbt <psbt> [--tier <t>]
//!   xbridge-wallet recover
//!   xbridge-wallet keygen
//!
//! Every spending command first rehydrates the ledger from the address
//! mempool, so earlier runs' unconfirmed spends are respected.

use std::env;
use std::process;

use xbridge_wallet::config::WalletConfig;
use xbridge_wallet::logging;
use xbridge_wallet::units;
use xbridge_wallet::wallet::{
    parse_psbt, BroadcastResult, Engine, FeeTier, PaymentRequest, SingleKeySigner, TxSigner,
};
use xbridge_wallet::WalletError;

/// Failure of a CLI command
#[derive(Debug, thiserror::Error)]
enum CliError {
    /// Malformed arguments; not an engine failure
    #[error("{0}")]
    Usage(String),

    #[error(transparent)]
    Wallet(#[from] WalletError),
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return;
    }

    let config = match WalletConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = logging::init_from_config(&config) {
        eprintln!("Warning: {}", e);
    }

    let result = match args[1].as_str() {
        "address" => cmd_address(&config),
        "status" => cmd_status(&config).await,
        "fees" => cmd_fees(&config).await,
        "send" => cmd_send(&config, &args[2..]).await,
        "sign-psbt" => cmd_sign_psbt(&config, &args[2..]).await,
        "rebuild-psbt" => cmd_rebuild_psbt(&config, &args[2..]).await,
        "recover" => cmd_recover(&config).await,
        "keygen" => {
            cmd_keygen(&config);
            Ok(())
        }
        _ => {
            print_usage();
            Ok(())
        }
    };

    match result {
        Ok(()) => {}
        Err(CliError::Usage(message)) => {
            eprintln!("Usage error: {}", message);
            eprintln!("Run without arguments for usage.");
            process::exit(1);
        }
        Err(CliError::Wallet(e)) => {
            eprintln!("Error [{}]: {}", e.error_code(), e);
            process::exit(1);
        }
    }
}

fn print_usage() {
    println!("xBridge Wallet - Self-custodied Bitcoin spending engine");
    println!();
    println!("Usage:");
    println!("  xbridge-wallet address                            Show signing address");
    println!("  xbridge-wallet status                             Spendable balance and ledger state");
    println!("  xbridge-wallet fees                               Current fee rates");
    println!("  xbridge-wallet send <addr> <sats> [options]       Pay a recipient");
    println!("      --memo <text|0xhex>                           Bridge memo (OP_RETURN)");
    println!("      --tier <priority|normal|economy>              Fee tier (default: normal)");
    println!("      --wait                                        Wait until the indexer sees it");
    println!("  xbridge-wallet sign-psbt <psbt>                   Sign and broadcast a venue PSBT");
    println!("  xbridge-wallet rebuild-psbt <psbt> [--tier <t>]   Re-select inputs for a venue PSBT");
    println!("  xbridge-wallet recover                            Rehydrate ledger from mempool");
    println!("  xbridge-wallet keygen                             Generate new signing key");
    println!();
    println!("Examples:");
    println!("  xbridge-wallet send tb1q... 50000");
    println!("  xbridge-wallet send tb1q... 250000 --memo '=:ETH.ETH:0xabc' --wait");
    println!();
    println!("Environment:");
    println!("  WALLET_NETWORK        mainnet | testnet | signet | regtest");
    println!("  WALLET_SIGNER_KEY     WIF or hex-encoded 32-byte signing key");
    println!("  WALLET_ESPLORA_URL    Esplora API URL");
    println!("  WALLET_FEE_API        Fee estimator URL, or 'none'");
}

/// Build the engine and replay the address mempool into its ledger
async fn spending_engine(config: &WalletConfig) -> Result<Engine, WalletError> {
    let engine = Engine::from_config(config)?;
    let stats = engine.recover_on_startup().await?;
    if stats.transactions > 0 {
        println!(
            "Recovered {} pending tx(s): {} spent input(s), {} change output(s)",
            stats.transactions, stats.spent_inputs, stats.change_outputs
        );
    }
    Ok(engine)
}

fn cmd_address(config: &WalletConfig) -> Result<(), CliError> {
    let engine = Engine::from_config(config)?;
    match engine.address() {
        Some(address) => println!("{}", address),
        None => return Err(WalletError::NoCredential.into()),
    }
    Ok(())
}

async fn cmd_status(config: &WalletConfig) -> Result<(), CliError> {
    config.print_summary();
    println!();

    let engine = spending_engine(config).await?;
    let summary = engine.spendable().await?;

    println!("=== Wallet Status ===");
    println!("Address: {}", summary.address);
    println!("Indexer UTXOs: {}", summary.reported);
    println!(
        "Spendable: {} in {} UTXO(s)",
        units::format_sats(summary.available_sats),
        summary.available.len()
    );
    println!("{}", summary.exclusions);
    println!("{}", summary.ledger);
    println!("=====================");
    Ok(())
}

async fn cmd_fees(config: &WalletConfig) -> Result<(), CliError> {
    let engine = Engine::from_config(config)?;
    let rates = engine.fee_rates().await;

    println!("Fee rates (sat/vB):");
    println!("  priority: {}", rates.for_tier(FeeTier::Priority));
    println!("  normal:   {}", rates.for_tier(FeeTier::Normal));
    println!("  economy:  {}", rates.for_tier(FeeTier::Economy));
    println!("  minimum:  {}", rates.minimum);
    Ok(())
}

async fn cmd_send(config: &WalletConfig, args: &[String]) -> Result<(), CliError> {
    if args.len() < 2 {
        println!("Usage: xbridge-wallet send <addr> <sats> [--memo <m>] [--tier <t>] [--wait]");
        return Ok(());
    }

    let amount = parse_amount(&args[1])?;
    let mut request = PaymentRequest::new(args[0].clone(), amount);
    let mut wait = false;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--memo" if i + 1 < args.len() => {
                request = request.with_memo(parse_memo(&args[i + 1])?);
                i += 2;
            }
            "--tier" if i + 1 < args.len() => {
                request = request.with_tier(parse_tier(&args[i + 1])?);
                i += 2;
            }
            "--wait" => {
                wait = true;
                i += 1;
            }
            _ => i += 1,
        }
    }

    let engine = spending_engine(config).await?;
    let result = engine.pay(request).await?;
    print_broadcast(&result);

    if wait {
        println!("Waiting for the indexer...");
        if engine.wait_for_visibility(&result.txid).await {
            println!("Transaction visible");
        } else {
            println!("Transaction not visible yet; it was broadcast and may still propagate");
        }
    }
    Ok(())
}

async fn cmd_sign_psbt(config: &WalletConfig, args: &[String]) -> Result<(), CliError> {
    if args.is_empty() {
        println!("Usage: xbridge-wallet sign-psbt <base64|hex>");
        return Ok(());
    }

    let psbt = parse_psbt(&args[0])?;
    let engine = spending_engine(config).await?;

    match engine.sign_and_broadcast(psbt).await {
        Ok(result) => {
            print_broadcast(&result);
            Ok(())
        }
        Err(e) => {
            for conflict in e.conflicts() {
                eprintln!("  conflict: {}", conflict);
            }
            if e.is_retryable() {
                eprintln!("Inputs are stale; try `rebuild-psbt` to re-select them");
            }
            Err(e.into())
        }
    }
}

async fn cmd_rebuild_psbt(config: &WalletConfig, args: &[String]) -> Result<(), CliError> {
    if args.is_empty() {
        println!("Usage: xbridge-wallet rebuild-psbt <base64|hex> [--tier <t>]");
        return Ok(());
    }

    let psbt = parse_psbt(&args[0])?;
    let mut tier = FeeTier::default();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--tier" if i + 1 < args.len() => {
                tier = parse_tier(&args[i + 1])?;
                i += 2;
            }
            _ => i += 1,
        }
    }

    let engine = spending_engine(config).await?;
    let result = engine.rebuild_with_retry(&psbt, tier).await?;
    print_broadcast(&result);
    Ok(())
}

async fn cmd_recover(config: &WalletConfig) -> Result<(), CliError> {
    let engine = spending_engine(config).await?;
    println!("{}", engine.ledger_snapshot().await);
    Ok(())
}

fn cmd_keygen(config: &WalletConfig) {
    let signer = SingleKeySigner::generate(config.network.bitcoin_network());

    println!("=== New Signing Key ===");
    println!();
    println!("WIF:     {}", signer.to_wif());
    println!("Address: {}", signer.address());
    println!();
    println!("Set in environment:");
    println!("  export WALLET_SIGNER_KEY={}", signer.to_wif());
    println!();
    println!("WARNING: Keep this key secure! Anyone with it can spend the funds.");
}

fn print_broadcast(result: &BroadcastResult) {
    println!("Broadcast: {}", result.txid);
    println!("  Sent: {}", units::format_sats(result.sent));
    println!("  Fee:  {}", units::format_sats(result.fee));
    for (vout, value) in &result.change {
        println!("  Change: {} at vout {}", units::format_sats(*value), vout);
    }
    println!("  Inputs: {}", result.inputs.len());
}

fn parse_amount(raw: &str) -> Result<u64, CliError> {
    raw.parse()
        .map_err(|_| CliError::Usage(format!("invalid amount: {}", raw)))
}

/// `0x`-prefixed hex, otherwise the UTF-8 bytes of the text
fn parse_memo(raw: &str) -> Result<Vec<u8>, CliError> {
    match raw.strip_prefix("0x") {
        Some(hex_memo) => hex::decode(hex_memo)
            .map_err(|e| CliError::Usage(format!("invalid hex memo: {}", e))),
        None => Ok(raw.as_bytes().to_vec()),
    }
}

fn parse_tier(raw: &str) -> Result<FeeTier, CliError> {
    raw.parse().map_err(CliError::Usage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_arguments_are_usage_errors() {
        assert!(matches!(parse_amount("12k"), Err(CliError::Usage(_))));
        assert!(matches!(parse_memo("0xzz"), Err(CliError::Usage(_))));
        assert!(matches!(parse_tier("urgent"), Err(CliError::Usage(_))));

        assert_eq!(parse_amount("50000").unwrap(), 50_000);
        assert_eq!(parse_memo("0x3d3a").unwrap(), b"=:".to_vec());
        assert_eq!(parse_memo("=:BTC.BTC").unwrap(), b"=:BTC.BTC".to_vec());
        assert_eq!(parse_tier("economy").unwrap(), FeeTier::Economy);
    }

    #[test]
    fn test_engine_errors_keep_their_code() {
        let err: CliError = WalletError::NoCredential.into();
        match err {
            CliError::Wallet(e) => assert_eq!(e.error_code(), "NO_CREDENTIAL"),
            CliError::Usage(_) => panic!("engine error reported as usage"),
        }
    }

    #[test]
    fn test_generated_key_has_address() {
        let signer = SingleKeySigner::generate(bitcoin::Network::Regtest);
        assert!(signer.address().to_string().starts_with("bcrt1q"));
    }
}
