//! End-to-end scenario 1: a source of `(id, name, amount)` records flows
//! through a transform that adds an 8% tax field, and a sink collects the
//! results in order.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use conduit::{
    Context, ConduitResult, GraphBuilder, ItemTransform, Parameters, Pipe, PipeConfig,
    PipeConsumer, PipeSignal, Sink, Source, Terminal, Transform,
};

#[derive(Debug, Clone, PartialEq)]
struct Invoice {
    id: u32,
    name: &'static str,
    amount: u32,
}

#[derive(Debug, Clone, PartialEq)]
struct TaxedInvoice {
    id: u32,
    name: &'static str,
    amount: u32,
    tax: u32,
    total: u32,
}

struct Invoices(Vec<Invoice>);

#[async_trait]
impl Source<Invoice> for Invoices {
    async fn initialize(&mut self, _ctx: &Context) -> ConduitResult<Pipe<Invoice>> {
        let (tx, pipe) = conduit::core::pipe::channel::<Invoice>(PipeConfig::point_to_point(8));
        let invoices = self.0.clone();
        tokio::spawn(async move {
            for invoice in invoices {
                tx.publish(invoice).await.unwrap();
            }
            tx.complete();
        });
        Ok(pipe)
    }
}

struct ApplyTax;

#[async_trait]
impl ItemTransform<Invoice, TaxedInvoice> for ApplyTax {
    async fn transform(&self, item: Invoice, _ctx: &Context) -> ConduitResult<Option<TaxedInvoice>> {
        let tax = (item.amount * 108 / 100) - item.amount;
        let total = item.amount + tax;
        Ok(Some(TaxedInvoice {
            id: item.id,
            name: item.name,
            amount: item.amount,
            tax,
            total,
        }))
    }
}

struct Collect(Arc<Mutex<Vec<TaxedInvoice>>>);

#[async_trait]
impl Sink<TaxedInvoice> for Collect {
    async fn execute(&mut self, mut input: PipeConsumer<TaxedInvoice>, ctx: &Context) -> ConduitResult<()> {
        loop {
            match input.next(ctx.cancellation()).await {
                PipeSignal::Item(item) => self.0.lock().unwrap().push(item),
                PipeSignal::End(Terminal::Completed) => return Ok(()),
                PipeSignal::End(Terminal::Faulted(e)) => return Err(e),
                PipeSignal::End(Terminal::Cancelled) => return Err(conduit::ConduitError::Cancelled),
            }
        }
    }
}

#[tokio::test]
async fn tax_is_applied_and_order_is_preserved() {
    let collected = Arc::new(Mutex::new(Vec::new()));
    let mut builder = GraphBuilder::new();
    builder
        .add_source(
            "invoices",
            Invoices(vec![
                Invoice { id: 1, name: "A", amount: 100 },
                Invoice { id: 2, name: "B", amount: 250 },
                Invoice { id: 3, name: "C", amount: 75 },
            ]),
        )
        .add_transform("tax", Transform::Item(Box::new(ApplyTax)))
        .add_sink("sink", Collect(Arc::clone(&collected)))
        .connect("invoices", "tax")
        .connect("tax", "sink");

    let compiled = builder.build().expect("graph is valid");
    let outcome = conduit::runner::run(compiled, Context::new(Parameters::new())).await;

    assert!(outcome.is_success());
    assert_eq!(
        *collected.lock().unwrap(),
        vec![
            TaxedInvoice { id: 1, name: "A", amount: 100, tax: 8, total: 108 },
            TaxedInvoice { id: 2, name: "B", amount: 250, tax: 20, total: 270 },
            TaxedInvoice { id: 3, name: "C", amount: 75, tax: 6, total: 81 },
        ]
    );
}
