use alloy::sol;

// ─── Constant Flow Agreement ────────────────────────────────────────────────
sol! {
    #[allow(missing_docs)]
    #[derive(Debug, PartialEq, Eq)]
    #[sol(rpc)]
    contract ConstantFlowAgreement {
        event FlowUpdated(
            address indexed token,
            address indexed sender,
            address indexed receiver,
            int96 flowRate,
            int256 totalSenderFlowRate,
            int256 totalReceiverFlowRate,
            bytes userData
        );

        function getFlow(address token, address sender, address receiver)
            external view
            returns (uint256 timestamp, int96 flowRate, uint256 deposit, uint256 owedDeposit);
        function getNetFlow(address token, address account) external view returns (int96 flowRate);
    }
}

// ─── Instant Distribution Agreement ─────────────────────────────────────────
sol! {
    #[allow(missing_docs)]
    #[derive(Debug, PartialEq, Eq)]
    #[sol(rpc)]
    contract InstantDistributionAgreement {
        // === publisher-side events ===
        event IndexCreated(address indexed token, address indexed publisher, uint32 indexed indexId, bytes userData);
        event IndexUpdated(
            address indexed token,
            address indexed publisher,
            uint32 indexed indexId,
            uint128 oldIndexValue,
            uint128 newIndexValue,
            uint128 totalUnitsPending,
            uint128 totalUnitsApproved,
            bytes userData
        );
        event IndexSubscribed(address indexed token, address indexed publisher, uint32 indexed indexId, address subscriber, bytes userData);
        event IndexUnitsUpdated(address indexed token, address indexed publisher, uint32 indexed indexId, address subscriber, uint128 units, bytes userData);
        event IndexUnsubscribed(address indexed token, address indexed publisher, uint32 indexed indexId, address subscriber, bytes userData);
        event IndexDistributionClaimed(address indexed token, address indexed publisher, uint32 indexed indexId, address subscriber, uint256 amount);

        // === subscriber-side mirrors ===
        event SubscriptionApproved(address indexed token, address indexed subscriber, address publisher, uint32 indexId, bytes userData);
        event SubscriptionRevoked(address indexed token, address indexed subscriber, address publisher, uint32 indexId, bytes userData);
        event SubscriptionUnitsUpdated(address indexed token, address indexed subscriber, address publisher, uint32 indexId, uint128 units, bytes userData);
        event SubscriptionDistributionClaimed(address indexed token, address indexed subscriber, address publisher, uint32 indexId, uint256 amount);

        function getIndex(address token, address publisher, uint32 indexId)
            external view
            returns (bool exist, uint128 indexValue, uint128 totalUnitsApproved, uint128 totalUnitsPending);
        function getSubscription(address token, address publisher, uint32 indexId, address subscriber)
            external view
            returns (bool exist, bool approved, uint128 units, uint256 pendingDistribution);
    }
}

// ─── Super Token ────────────────────────────────────────────────────────────
sol! {
    #[allow(missing_docs)]
    #[derive(Debug, PartialEq, Eq)]
    #[sol(rpc)]
    contract SuperToken {
        event Transfer(address indexed from, address indexed to, uint256 value);

        function name() external view returns (string memory);
        function symbol() external view returns (string memory);
        function totalSupply() external view returns (uint256);
        function balanceOf(address account) external view returns (uint256);
        function getUnderlyingToken() external view returns (address);
        function realtimeBalanceOfNow(address account)
            external view
            returns (int256 availableBalance, uint256 deposit, uint256 owedDeposit, uint256 timestamp);
    }
}

// ─── Underlying ERC-20 ──────────────────────────────────────────────────────
sol! {
    #[allow(missing_docs)]
    #[derive(Debug, PartialEq, Eq)]
    #[sol(rpc)]
    contract ERC20 {
        function decimals() external view returns (uint8);
        function balanceOf(address account) external view returns (uint256);
    }
}

// ─── Super Token Factory ────────────────────────────────────────────────────
sol! {
    #[allow(missing_docs)]
    #[derive(Debug, PartialEq, Eq)]
    #[sol(rpc)]
    contract SuperTokenFactory {
        event SuperTokenCreated(address indexed token);
        event CustomSuperTokenCreated(address indexed token);
    }
}
