use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::pb::etcdserverpb::auth_server::Auth;
use crate::pb::etcdserverpb::{
    AuthDisableRequest, AuthDisableResponse, AuthEnableRequest, AuthEnableResponse,
    AuthStatusRequest, AuthStatusResponse, AuthenticateRequest, AuthenticateResponse,
    PermissionType as PbPermType, RoleAddRequest, RoleAddResponse, RoleDeleteRequest,
    RoleDeleteResponse, RoleGrantPermissionRequest, RoleGrantPermissionResponse, UserAddRequest,
    UserAddResponse, UserDeleteRequest, UserDeleteResponse, UserGrantRoleRequest,
    UserGrantRoleResponse,
};
use crate::server::auth::{PermType, Permission};
use crate::server::{header, to_auth_status as to_status, Shared};

pub struct AuthService {
    shared: Arc<Shared>,
}

impl AuthService {
    pub fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }
}

#[tonic::async_trait]
impl Auth for AuthService {
    async fn auth_enable(
        &self,
        _request: Request<AuthEnableRequest>,
    ) -> Result<Response<AuthEnableResponse>, Status> {
        self.shared.auth.lock().expect("auth state lock poisoned").enable();
        Ok(Response::new(AuthEnableResponse { header: Some(header(&self.shared)) }))
    }

    async fn auth_disable(
        &self,
        _request: Request<AuthDisableRequest>,
    ) -> Result<Response<AuthDisableResponse>, Status> {
        self.shared.auth.lock().expect("auth state lock poisoned").disable();
        Ok(Response::new(AuthDisableResponse { header: Some(header(&self.shared)) }))
    }

    async fn auth_status(
        &self,
        _request: Request<AuthStatusRequest>,
    ) -> Result<Response<AuthStatusResponse>, Status> {
        let enabled = self.shared.auth.lock().expect("auth state lock poisoned").is_enabled();
        Ok(Response::new(AuthStatusResponse { header: Some(header(&self.shared)), enabled }))
    }

    async fn authenticate(
        &self,
        request: Request<AuthenticateRequest>,
    ) -> Result<Response<AuthenticateResponse>, Status> {
        let req = request.into_inner();
        let token = self
            .shared
            .auth
            .lock()
            .expect("auth state lock poisoned")
            .authenticate(&req.name, &req.password)
            .map_err(to_status)?;
        Ok(Response::new(AuthenticateResponse { header: Some(header(&self.shared)), token }))
    }

    async fn user_add(
        &self,
        request: Request<UserAddRequest>,
    ) -> Result<Response<UserAddResponse>, Status> {
        let req = request.into_inner();
        self.shared.auth.lock().expect("auth state lock poisoned").add_user(req.name, req.password);
        Ok(Response::new(UserAddResponse { header: Some(header(&self.shared)) }))
    }

    async fn user_delete(
        &self,
        request: Request<UserDeleteRequest>,
    ) -> Result<Response<UserDeleteResponse>, Status> {
        let req = request.into_inner();
        self.shared
            .auth
            .lock()
            .expect("auth state lock poisoned")
            .delete_user(&req.name)
            .map_err(to_status)?;
        Ok(Response::new(UserDeleteResponse { header: Some(header(&self.shared)) }))
    }

    async fn user_grant_role(
        &self,
        request: Request<UserGrantRoleRequest>,
    ) -> Result<Response<UserGrantRoleResponse>, Status> {
        let req = request.into_inner();
        self.shared
            .auth
            .lock()
            .expect("auth state lock poisoned")
            .grant_role(&req.user, &req.role)
            .map_err(to_status)?;
        Ok(Response::new(UserGrantRoleResponse { header: Some(header(&self.shared)) }))
    }

    async fn role_add(
        &self,
        request: Request<RoleAddRequest>,
    ) -> Result<Response<RoleAddResponse>, Status> {
        let req = request.into_inner();
        self.shared.auth.lock().expect("auth state lock poisoned").add_role(req.name);
        Ok(Response::new(RoleAddResponse { header: Some(header(&self.shared)) }))
    }

    async fn role_delete(
        &self,
        request: Request<RoleDeleteRequest>,
    ) -> Result<Response<RoleDeleteResponse>, Status> {
        let req = request.into_inner();
        self.shared
            .auth
            .lock()
            .expect("auth state lock poisoned")
            .delete_role(&req.role)
            .map_err(to_status)?;
        Ok(Response::new(RoleDeleteResponse { header: Some(header(&self.shared)) }))
    }

    async fn role_grant_permission(
        &self,
        request: Request<RoleGrantPermissionRequest>,
    ) -> Result<Response<RoleGrantPermissionResponse>, Status> {
        let req = request.into_inner();
        let perm = req.perm.ok_or_else(|| Status::invalid_argument("missing perm"))?;
        let perm_type = match PbPermType::try_from(perm.perm_type).unwrap_or(PbPermType::Read) {
            PbPermType::Read => PermType::Read,
            PbPermType::Write => PermType::Write,
            PbPermType::ReadWrite => PermType::ReadWrite,
        };
        self.shared
            .auth
            .lock()
            .expect("auth state lock poisoned")
            .grant_permission(
                &req.name,
                Permission { perm: perm_type, key: perm.key, range_end: perm.range_end },
            )
            .map_err(to_status)?;
        Ok(Response::new(RoleGrantPermissionResponse { header: Some(header(&self.shared)) }))
    }
}
