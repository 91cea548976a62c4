//! Interface de terminal do pnpjob — spinners e saída colorida.
//!
//! Usa as crates `indicatif` para spinners de progresso e `console` para
//! estilização com cores. O [`JobProgress`] é um sink de telemetria que
//! acompanha visualmente a execução de um job no terminal.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::error::JobError;
use crate::processor::{JobEvent, JobOutcome, JobReport, Telemetry};

/// Indicador visual de progresso para a execução de um job no terminal.
///
/// O prefixo do spinner mostra o estado atual e a mensagem o último status.
/// Posicionamentos concluídos aparecem em verde, pulados e alimentadores
/// desabilitados em amarelo e erros em vermelho.
pub struct JobProgress {
    // Barra de progresso/spinner do indicatif.
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl JobProgress {
    /// Inicia o spinner com o nome do job e retorna a instância de progresso.
    pub fn start(job_name: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {prefix:.bold} {msg}")
                .expect("invalid template"),
        );
        pb.set_prefix("UNINITIALIZED");
        pb.set_message(format!("loading {job_name}"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        Self::with_bar(pb)
    }

    fn with_bar(pb: ProgressBar) -> Self {
        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Finaliza o spinner e exibe o resultado final do job.
    pub fn complete(&self, outcome: Option<&JobOutcome>, result: &Result<(), JobError>) {
        self.pb.finish_and_clear();
        match (outcome, result) {
            (_, Err(e)) => println!("  {} Job failed: {e}", self.red.apply_to("✗")),
            (Some(JobOutcome::Aborted), Ok(())) => {
                println!("  {} Job aborted", self.yellow.apply_to("■"))
            }
            _ => println!("  {} Job completed successfully", self.green.apply_to("✓")),
        }
    }

    /// Imprime o relatório do job formatado em JSON com estilo colorido.
    pub fn print_report(&self, report: &JobReport) {
        let style = match report.outcome {
            JobOutcome::Completed => &self.green,
            JobOutcome::Failed { .. } => &self.red,
            JobOutcome::Aborted => &self.yellow,
        };
        println!();
        println!("{}", style.apply_to("─── Job Report ───"));
        println!("{}", serde_json::to_string_pretty(report).unwrap_or_default());
    }
}

impl Telemetry for JobProgress {
    fn emit(&self, event: JobEvent) {
        match event {
            JobEvent::Status(text) => self.pb.set_message(text),
            JobEvent::StateChanged { to, .. } => self.pb.set_prefix(to.to_string()),
            JobEvent::PlacementComplete {
                board,
                placement,
                nozzle,
            } => self.pb.println(format!(
                "  {} {board}:{placement} placed by {nozzle}",
                self.green.apply_to("✓")
            )),
            JobEvent::PlacementSkipped { board, placement } => self.pb.println(format!(
                "  {} {board}:{placement} skipped",
                self.yellow.apply_to("↷")
            )),
            JobEvent::PlacementErrored {
                board,
                placement,
                message,
                ..
            } => self.pb.println(format!(
                "  {} {board}:{placement}: {message}",
                self.red.apply_to("✗")
            )),
            JobEvent::FeederDisabled { feeder, reason } => self.pb.println(format!(
                "  {} feeder {feeder} disabled: {reason}",
                self.yellow.apply_to("↻")
            )),
            JobEvent::Error { kind, message } => self.pb.println(format!(
                "  {} {kind}: {message}",
                self.red.apply_to("✗")
            )),
            JobEvent::Finished(_) => {}
        }
    }
}
