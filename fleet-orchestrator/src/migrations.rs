use sqlx::{Pool, Postgres};

/// Inline idempotent schema. CREATE TYPE has no IF NOT EXISTS, so every
/// statement runs best-effort; reruns are no-ops.
pub async fn run_inline_migrations(pool: &Pool<Postgres>) {
    println!("📦 Running Migrations (Inline Schema)...");

    let schema_sql = r#"
        CREATE TYPE vm_status AS ENUM ('provisioning', 'ready', 'assigned', 'failed');
        CREATE TYPE vm_health AS ENUM ('unknown', 'configuring', 'healthy', 'configure_failed');
        CREATE TYPE api_mode AS ENUM ('byok', 'proxied');
        CREATE TABLE IF NOT EXISTS vms (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            name VARCHAR(100) UNIQUE NOT NULL,
            provider VARCHAR(50) NOT NULL,
            provider_instance_id VARCHAR(255),
            ip_address INET,
            region VARCHAR(50),
            instance_class VARCHAR(50),
            ssh_port INTEGER NOT NULL DEFAULT 22,
            ssh_user VARCHAR(50) NOT NULL DEFAULT 'agent',
            status vm_status NOT NULL DEFAULT 'provisioning',
            health_status vm_health NOT NULL DEFAULT 'unknown',
            assigned_to UUID,
            configure_attempts INTEGER NOT NULL DEFAULT 0,
            tier VARCHAR(50),
            api_mode api_mode,
            channels JSONB,
            gateway_url TEXT,
            gateway_token TEXT,
            control_url TEXT,
            model VARCHAR(100),
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            last_health_check TIMESTAMPTZ
        );
        CREATE TABLE IF NOT EXISTS pending_configs (
            customer_id UUID PRIMARY KEY,
            api_mode api_mode NOT NULL,
            api_key TEXT,
            tier VARCHAR(50) NOT NULL,
            model VARCHAR(100) NOT NULL,
            channels JSONB NOT NULL DEFAULT '[]'::jsonb,
            search_key TEXT,
            seed_memory TEXT,
            system_prompt TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
        CREATE TABLE IF NOT EXISTS backups (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            vm_id UUID NOT NULL,
            storage_path TEXT NOT NULL,
            size_bytes BIGINT NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
        CREATE TABLE IF NOT EXISTS vm_state_history (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            vm_id UUID NOT NULL,
            from_status VARCHAR(50) NOT NULL,
            to_status VARCHAR(50) NOT NULL,
            reason TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
        CREATE TABLE IF NOT EXISTS action_logs (
            id UUID PRIMARY KEY,
            action_type VARCHAR(100) NOT NULL,
            component VARCHAR(50) NOT NULL DEFAULT 'orchestrator',
            status VARCHAR(20) NOT NULL,
            error_message TEXT,
            vm_id UUID,
            metadata JSONB,
            duration_ms INTEGER,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            completed_at TIMESTAMPTZ
        );
        CREATE TABLE IF NOT EXISTS configure_attempt_log (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            vm_id UUID NOT NULL,
            attempted_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
    "#;

    for statement in schema_sql.split(';') {
        let stmt = statement.trim();
        if !stmt.is_empty() {
            let _ = sqlx::query(stmt).execute(pool).await;
        }
    }

    let db_updates = vec![
        r#"CREATE INDEX IF NOT EXISTS idx_vms_status ON vms (status)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_vms_assigned_to ON vms (assigned_to)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_backups_vm_created ON backups (vm_id, created_at DESC)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_attempts_vm_time ON configure_attempt_log (vm_id, attempted_at DESC)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_action_logs_vm ON action_logs (vm_id, created_at DESC)"#,
    ];

    for stmt in db_updates {
        let _ = sqlx::query(stmt).execute(pool).await;
    }

    println!("✅ Migrations (Inline) Applied");
}
