//! Interface de linha de comando do pnpjob baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, graph, demo)
//! e flags globais (--config, --feed-retries, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// pnpjob — Executor de jobs de pick-and-place.
#[derive(Debug, Parser)]
#[command(name = "pnpjob", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração (padrão: `pnpjob.toml`).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Retentativas de alimentação por alimentador, sobrescrevendo a configuração.
    #[arg(long, global = true)]
    pub feed_retries: Option<u32>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Executa um job na máquina simulada.
    Run {
        /// Arquivo TOML com o job (placas, posicionamentos e peças).
        job: PathBuf,

        /// Arquivo TOML descrevendo a máquina.
        #[arg(long, default_value = "machine.toml")]
        machine: PathBuf,
    },

    /// Imprime a tabela de transições do processador em formato DOT.
    Graph,

    /// Executa a demonstração embutida da árvore de comandos.
    Demo {
        /// Número de alimentações que falham antes de funcionar.
        #[arg(long, default_value_t = 0)]
        feed_failures: u32,
    },
}
