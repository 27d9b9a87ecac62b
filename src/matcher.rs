//! Exact (non-probabilistic) matching of transactions against wallet elements.
use std::collections::{BTreeMap, BTreeSet, HashMap};

use bitcoin::{
    script::Instruction, Amount, Block, OutPoint, Script, ScriptBuf, Transaction, Txid,
};

use crate::{
    elements::{ElementKind, Elements, TargetId},
    types::ElementIndex,
};

/// Data pushes of `script` whose length is one of the element classes.
/// Malformed trailing bytes end the iteration.
pub fn script_elements(script: &Script) -> impl Iterator<Item = &[u8]> + '_ {
    script
        .instructions()
        .map_while(Result::ok)
        .filter_map(|ins| match ins {
            Instruction::PushBytes(bytes) => Some(bytes.as_bytes()),
            Instruction::Op(_) => None,
        })
        .filter(|bytes| ElementKind::from_len(bytes.len()).is_some())
}

/// A wallet output created by a transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchedOutput {
    /// Output index.
    pub vout: u32,
    /// Amount paid.
    pub value: Amount,
    /// Output script.
    pub script_pubkey: ScriptBuf,
    /// Pattern that matched.
    pub target: TargetId,
}

impl MatchedOutput {
    /// Key that owns the output.
    pub fn owner(&self) -> Option<ElementIndex> {
        match self.target {
            TargetId::Element(_, index) => Some(index),
            TargetId::Txo(_) => None,
        }
    }
}

/// A wallet output spent by a transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchedSpend {
    /// Input index.
    pub input: u32,
    /// Output consumed.
    pub outpoint: OutPoint,
    /// Key that owned it.
    pub owner: ElementIndex,
}

/// A transaction relevant to the wallet and why.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionMatch {
    /// The transaction.
    pub tx: Transaction,
    /// Outputs paying wallet patterns.
    pub outputs: Vec<MatchedOutput>,
    /// Inputs spending wallet outputs.
    pub spends: Vec<MatchedSpend>,
}

impl TransactionMatch {
    /// Transaction id.
    pub fn txid(&self) -> Txid {
        self.tx.compute_txid()
    }
}

/// Lookup tables for one matching pass.
pub struct Matcher {
    patterns: HashMap<Vec<u8>, TargetId>,
    txos: BTreeMap<OutPoint, ElementIndex>,
}

impl Matcher {
    /// Prepare to match against `elements`, limited to `restrict` when given.
    ///
    /// An output target is allowed when listed; a wallet output is allowed when
    /// its own target or any pattern of its owner is listed.
    pub fn new(elements: &Elements, restrict: Option<&BTreeSet<TargetId>>) -> Self {
        let allowed = |id: &TargetId| restrict.map_or(true, |r| r.contains(id));
        let owners: Option<BTreeSet<ElementIndex>> = restrict.map(|r| {
            r.iter()
                .filter_map(|t| match t {
                    TargetId::Element(_, i) => Some(*i),
                    TargetId::Txo(_) => None,
                })
                .collect()
        });
        let patterns = elements
            .patterns()
            .filter(|(id, _)| allowed(id))
            .map(|(id, data)| (data.to_vec(), id))
            .collect();
        let txos = elements
            .txos
            .iter()
            .filter(|(op, owner)| {
                allowed(&TargetId::Txo(*op))
                    || owners.as_ref().map_or(true, |o| o.contains(owner))
            })
            .map(|(op, owner)| (*op, *owner))
            .collect();
        Self { patterns, txos }
    }

    /// Match one transaction; `None` when nothing in it concerns the wallet.
    pub fn match_transaction(&self, tx: &Transaction) -> Option<TransactionMatch> {
        let mut outputs = Vec::new();
        for (vout, out) in tx.output.iter().enumerate() {
            let hit = script_elements(&out.script_pubkey).find_map(|push| self.patterns.get(push));
            if let Some(target) = hit {
                outputs.push(MatchedOutput {
                    vout: vout as u32,
                    value: out.value,
                    script_pubkey: out.script_pubkey.clone(),
                    target: *target,
                });
            }
        }

        let mut spends = Vec::new();
        if !tx.is_coinbase() {
            for (input, txin) in tx.input.iter().enumerate() {
                if let Some(owner) = self.txos.get(&txin.previous_output) {
                    spends.push(MatchedSpend {
                        input: input as u32,
                        outpoint: txin.previous_output,
                        owner: *owner,
                    });
                }
            }
        }

        if outputs.is_empty() && spends.is_empty() {
            None
        } else {
            Some(TransactionMatch {
                tx: tx.clone(),
                outputs,
                spends,
            })
        }
    }

    /// Match every transaction of `block` in order. Outputs created earlier in
    /// the block are recognised when a later transaction spends them.
    pub fn match_block(&mut self, block: &Block) -> Vec<TransactionMatch> {
        let mut out = Vec::new();
        for tx in &block.txdata {
            if let Some(found) = self.match_transaction(tx) {
                let txid = tx.compute_txid();
                for output in &found.outputs {
                    if let Some(owner) = output.owner() {
                        self.txos.insert(
                            OutPoint {
                                txid,
                                vout: output.vout,
                            },
                            owner,
                        );
                    }
                }
                out.push(found);
            }
        }
        out
    }
}

/// Exact matches of `block` against `elements`.
pub fn match_block(
    block: &Block,
    elements: &Elements,
    restrict: Option<&BTreeSet<TargetId>>,
) -> Vec<TransactionMatch> {
    Matcher::new(elements, restrict).match_block(block)
}

/// Exact match of a single (mempool) transaction against every element.
pub fn match_transaction(tx: &Transaction, elements: &Elements) -> Option<TransactionMatch> {
    Matcher::new(elements, None).match_transaction(tx)
}
