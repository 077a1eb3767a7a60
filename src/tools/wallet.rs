//! Standard wallet and savings tools
//!
//! Reads run immediately; anything that moves funds is confirmation-gated.

use crate::tools::schema::{
    integer_property, object_schema, string_enum_property, string_property,
};
use crate::tools::{ExecutorTool, Tool, ToolDescriptor, ToolExecutor};
use std::sync::Arc;

pub fn wallet_tool_definitions() -> Vec<ToolDescriptor> {
    vec![
        // Read operations
        ToolDescriptor::new(
            "get_balance",
            "Get the user's wallet balance across all tokens and chains.",
            object_schema(
                vec![
                    ("chain", string_property("Optional: filter by blockchain (e.g. 'arbitrum', 'base')")),
                    ("token", string_property("Optional: filter by token (e.g. 'usdc', 'eurc')")),
                ],
                &[],
            ),
        ),
        ToolDescriptor::new(
            "get_savings_balance",
            "Get the user's savings positions and current APY.",
            object_schema(vec![("vault", string_property("Optional: filter by vault name"))], &[]),
        ),
        ToolDescriptor::new(
            "get_vault_rates",
            "Get current APY rates for available savings vaults.",
            object_schema(vec![], &[]),
        ),
        ToolDescriptor::new(
            "get_transactions",
            "Get the user's recent transaction history.",
            object_schema(
                vec![
                    ("limit", integer_property("Number of transactions to return (default: 10)")),
                    (
                        "type",
                        string_enum_property(
                            "Filter by transaction type",
                            &["send", "receive", "deposit", "withdraw"],
                        ),
                    ),
                ],
                &[],
            ),
        ),
        ToolDescriptor::new(
            "get_profile",
            "Get the user's profile information.",
            object_schema(vec![], &[]),
        ),
        ToolDescriptor::new(
            "search_users",
            "Search for users by display tag or name.",
            object_schema(
                vec![("query", string_property("Display tag like @alice, or a name"))],
                &["query"],
            ),
        ),
        // Write operations
        ToolDescriptor::new(
            "send_money",
            "Send money to another user. Requires confirmation.",
            object_schema(
                vec![
                    ("recipient", string_property("Recipient display tag (e.g. alice) or user id")),
                    ("amount", string_property("Amount to send (e.g. '50.00')")),
                    ("token", string_property("Token to send (e.g. usdc)")),
                    ("note", string_property("Optional payment note")),
                ],
                &["recipient", "amount", "token"],
            ),
        )
        .with_confirmation("Send {amount} {token} to @{recipient}"),
        ToolDescriptor::new(
            "deposit_savings",
            "Deposit funds into a savings vault. Requires confirmation.",
            object_schema(
                vec![
                    ("amount", string_property("Amount to deposit")),
                    ("token", string_property("Token to deposit (e.g. usdc)")),
                    ("vault", string_property("Vault to deposit into")),
                ],
                &["amount", "token", "vault"],
            ),
        )
        .with_confirmation("Deposit {amount} {token} into {vault}"),
        ToolDescriptor::new(
            "withdraw_savings",
            "Withdraw funds from a savings vault. Requires confirmation.",
            object_schema(
                vec![
                    ("amount", string_property("Amount to withdraw")),
                    ("token", string_property("Token to withdraw (e.g. usdc)")),
                    ("vault", string_property("Vault to withdraw from")),
                ],
                &["amount", "token", "vault"],
            ),
        )
        .with_confirmation("Withdraw {amount} {token} from {vault}"),
    ]
}

/// Bind every wallet definition to the given executor
pub fn wallet_tools(executor: Arc<dyn ToolExecutor>) -> Vec<Arc<dyn Tool>> {
    wallet_tool_definitions()
        .into_iter()
        .map(|descriptor| {
            Arc::new(ExecutorTool::new(descriptor, Arc::clone(&executor))) as Arc<dyn Tool>
        })
        .collect()
}
