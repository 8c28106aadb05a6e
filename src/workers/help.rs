//! Usage guide worker (terminal)

use super::{Worker, WorkerOutput, WorkerRequest};
use crate::models::{Message, OutcomeKind, ToolSpec, WorkerId, WorkerSpec};
use crate::outcome::SUCCESS_MARKER;
use crate::Result;

pub const USAGE_GUIDE: &str = "\
Here are some examples of what you can ask me:

Single-step calculations:
* WACC: \"Calculate the WACC. Ke=12%, Kd=8%, E=60M, D=40M, tax rate 25%.\"
* NPV: \"Calculate the NPV of a project. Initial investment 100,000. Flows [30000, 40000, 50000]. Discount rate 10%.\"
* Bond: \"Price a bond: face value 1,000, 5% annual coupon, 10 years, YTM 6%, annual payments.\"
* CAPM: \"What is Ke using CAPM? Risk-free rate 3%, beta 1.2, market return 10%.\"
* Sharpe: \"Calculate the Sharpe ratio. Return 15%, risk-free rate 4%, volatility 20%.\"
* Gordon: \"Value a share with Gordon growth. D1=2.50, Ke=12%, g=4%.\"
* Call: \"Price a call option: S=100, K=105, T=0.5 years, r=5%, sigma=20%.\"

Concepts:
* \"What is modified duration?\" or \"Explain the WACC\" searches the indexed documentation.

Give every value in one message; missing values will be asked for by name.";

pub struct HelpWorker {
    spec: WorkerSpec,
}

impl HelpWorker {
    pub fn new() -> Self {
        Self {
            spec: WorkerSpec {
                id: WorkerId::Help,
                description: "Explains what the assistant can do, with example questions".to_string(),
                tools: vec![ToolSpec {
                    name: "usage_examples".to_string(),
                    description: "Example questions per calculation".to_string(),
                    params: Vec::new(),
                }],
                terminal: true,
            },
        }
    }
}

impl Default for HelpWorker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Worker for HelpWorker {
    fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    async fn execute(&self, _request: WorkerRequest) -> Result<WorkerOutput> {
        Ok(WorkerOutput::answer(
            Message::worker(WorkerId::Help, format!("{}\n\n{}", USAGE_GUIDE, SUCCESS_MARKER)),
            OutcomeKind::Success,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    #[test]
    fn test_guide_is_returned() {
        let worker = HelpWorker::new();
        let output = tokio_test::block_on(worker.execute(WorkerRequest {
            session_id: Uuid::new_v4(),
            history: vec![Message::user("ayuda")],
            cancel: CancellationToken::new(),
        }))
        .unwrap();

        assert_eq!(output.signal, Some(OutcomeKind::Success));
        assert!(output.messages[0].content.contains("Sharpe"));
        assert!(worker.spec().terminal);
    }
}
